use async_trait::async_trait;
use octocrab::Octocrab;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::GitHubConfig;
use crate::contract::IssueSpec;
use crate::error::{AppError, Result};
use crate::tracker::IssueTracker;

use super::auth::generate_app_jwt;

/// Files issues through a GitHub App installation.
pub struct GitHubTracker {
    config: GitHubConfig,
    /// Installation token and its expiry.
    token_cache: Arc<RwLock<Option<(String, chrono::DateTime<chrono::Utc>)>>>,
}

impl GitHubTracker {
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        if !config.private_key_path.exists() {
            return Err(AppError::Config(format!(
                "GitHub App private key not found at: {}",
                config.private_key_path.display()
            )));
        }

        Ok(Self {
            config: config.clone(),
            token_cache: Arc::new(RwLock::new(None)),
        })
    }

    async fn access_token(&self) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expiry)) = cache.as_ref() {
                if *expiry > chrono::Utc::now() + chrono::Duration::minutes(5) {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = generate_app_jwt(self.config.app_id, &self.config.private_key_path)?;
        let client = Octocrab::builder()
            .personal_token(jwt)
            .build()
            .map_err(|e| AppError::GitHubApi(format!("Failed to build JWT client: {e}")))?;

        let url = format!(
            "/app/installations/{}/access_tokens",
            self.config.installation_id
        );
        let response: serde_json::Value = client
            .post(&url, None::<&()>)
            .await
            .map_err(|e| AppError::GitHubApi(format!("Failed to create installation token: {e}")))?;

        let token = response["token"]
            .as_str()
            .ok_or_else(|| AppError::GitHubApi("No token in response".to_string()))?
            .to_string();

        let expires_at = response["expires_at"]
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|| chrono::Utc::now() + chrono::Duration::hours(1));

        *self.token_cache.write().await = Some((token.clone(), expires_at));
        Ok(token)
    }

    async fn installation_client(&self) -> Result<Octocrab> {
        let token = self.access_token().await?;
        Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| AppError::GitHubApi(format!("Failed to build octocrab client: {e}")))
    }
}

/// Split `owner/repo`, tolerating a `github.com/` or URL prefix.
pub(crate) fn parse_repo(repository_reference: &str) -> Result<(&str, &str)> {
    let trimmed = repository_reference
        .trim()
        .trim_end_matches('/')
        .trim_end_matches(".git");
    let trimmed = trimmed
        .strip_prefix("https://github.com/")
        .or_else(|| trimmed.strip_prefix("github.com/"))
        .unwrap_or(trimmed);

    match trimmed.split_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
            Ok((owner, repo))
        }
        _ => Err(AppError::Tracker(format!(
            "Invalid repository reference: {repository_reference}"
        ))),
    }
}

#[async_trait]
impl IssueTracker for GitHubTracker {
    fn name(&self) -> &str {
        "github"
    }

    async fn create_issue(&self, repository_reference: &str, issue: &IssueSpec) -> Result<String> {
        let (owner, repo) = parse_repo(repository_reference)?;
        let client = self.installation_client().await?;

        let created = client
            .issues(owner, repo)
            .create(&issue.title)
            .body(&issue.body)
            .labels(issue.labels.clone())
            .send()
            .await?;

        tracing::info!(
            repo = %format!("{owner}/{repo}"),
            number = created.number,
            "Created issue"
        );

        Ok(format!("{owner}/{repo}#{}", created.number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repo_forms() {
        assert_eq!(parse_repo("acme/widgets").unwrap(), ("acme", "widgets"));
        assert_eq!(
            parse_repo("https://github.com/acme/widgets.git").unwrap(),
            ("acme", "widgets")
        );
        assert_eq!(parse_repo("github.com/acme/widgets/").unwrap(), ("acme", "widgets"));
        assert!(parse_repo("widgets").is_err());
        assert!(parse_repo("acme/widgets/extra").is_err());
    }

    #[test]
    fn test_missing_private_key_is_rejected_up_front() {
        let config = GitHubConfig {
            app_id: 1,
            private_key_path: "/nonexistent/foreman.pem".into(),
            installation_id: 2,
        };
        assert!(matches!(GitHubTracker::new(&config), Err(AppError::Config(_))));
    }
}

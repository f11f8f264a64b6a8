use serde::Deserialize;
use std::path::PathBuf;

use crate::adapter::RemoteEndpoint;
use crate::contract::{Environment, StageName, TransportMode};
use crate::error::{AppError, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    pub github: Option<GitHubConfig>,
    pub claude: Option<ClaudeConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Finished results kept for `GET /runs/{run_id}`; the oldest go first.
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            retained_runs: default_retained_runs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            run_deadline_secs: default_run_deadline_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            stages: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    Required,
    Optional,
}

/// Per-stage override of the default plan.
#[derive(Debug, Deserialize, Clone)]
pub struct StageConfig {
    pub stage: StageName,
    pub requirement: Option<Requirement>,
    pub fallback: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default)]
    pub retry_auth_errors: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            retry_auth_errors: false,
        }
    }
}

/// Operator-granted permission for external writes in `create` mode.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum WritePermission {
    #[default]
    None,
    /// Enough for `staging`.
    Standard,
    /// Required for `prod`.
    Elevated,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuardrailConfig {
    #[serde(default)]
    pub write_permission: WritePermission,
    #[serde(default = "default_max_issues_ceiling")]
    pub max_issues_ceiling: u32,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            write_permission: WritePermission::None,
            max_issues_ceiling: default_max_issues_ceiling(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ReadinessConfig {
    #[serde(default)]
    pub required_settings: RequiredSettings,
}

/// Environment variables that must be set before a run in each environment.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RequiredSettings {
    #[serde(default)]
    pub dev: Vec<String>,
    #[serde(default)]
    pub staging: Vec<String>,
    #[serde(default)]
    pub prod: Vec<String>,
}

impl RequiredSettings {
    pub fn for_environment(&self, environment: Environment) -> &[String] {
        match environment {
            Environment::Dev => &self.dev,
            Environment::Staging => &self.staging,
            Environment::Prod => &self.prod,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub role: String,
    pub mode: TransportMode,
    /// Handler reference (local) or endpoint id (remote).
    pub target: String,
}

#[derive(Deserialize, Clone)]
pub struct EndpointConfig {
    pub id: String,
    pub url: String,
    pub token: Option<String>,
    pub signing_secret: Option<String>,
}

// Manual Debug impl to avoid leaking endpoint credentials
impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl EndpointConfig {
    pub fn to_endpoint(&self) -> RemoteEndpoint {
        RemoteEndpoint {
            id: self.id.clone(),
            url: self.url.clone(),
            token: self.token.clone(),
            signing_secret: self.signing_secret.clone(),
        }
    }
}

/// Serving this process's local handlers to remote orchestrators.
#[derive(Deserialize, Clone, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub enabled: bool,
    pub token: Option<String>,
    pub signing_secret: Option<String>,
}

// Manual Debug impl to avoid leaking host credentials
impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("enabled", &self.enabled)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct HooksConfig {
    pub journal_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitHubConfig {
    pub app_id: u64,
    pub private_key_path: PathBuf,
    pub installation_id: u64,
}

#[derive(Deserialize, Clone)]
pub struct ClaudeConfig {
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

// Manual Debug impl to avoid leaking the API key
impl std::fmt::Debug for ClaudeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_retained_runs() -> usize {
    1000
}

fn default_run_deadline_secs() -> u64 {
    600
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_max_issues_ceiling() -> u32 {
    25
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            // Try default paths
            builder = builder.add_source(config::File::with_name("foreman").required(false));
        }

        // Environment variable overrides with FOREMAN_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("FOREMAN")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let config: AppConfig = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config.check()?;
        Ok(config)
    }

    /// Structural checks that don't depend on a particular request.
    pub fn check(&self) -> Result<()> {
        if self.pipeline.call_timeout_secs == 0 || self.pipeline.run_deadline_secs == 0 {
            return Err(AppError::Config(
                "pipeline timeouts must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(AppError::Config(
                "retry.jitter must be between 0 and 1".to_string(),
            ));
        }
        for (index, stage) in self.pipeline.stages.iter().enumerate() {
            if self.pipeline.stages[..index]
                .iter()
                .any(|s| s.stage == stage.stage)
            {
                return Err(AppError::Config(format!(
                    "stage `{}` configured twice",
                    stage.stage
                )));
            }
        }
        for endpoint in &self.endpoints {
            if !endpoint.url.starts_with("http://") && !endpoint.url.starts_with("https://") {
                return Err(AppError::Config(format!(
                    "endpoint `{}` must use an http(s) URL",
                    endpoint.id
                )));
            }
        }
        Ok(())
    }
}

pub mod github;

use async_trait::async_trait;

use crate::contract::IssueSpec;
use crate::error::Result;

/// External issue tracker reached in `create` mode.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    fn name(&self) -> &str;

    /// File one issue and return its tracker reference, e.g. `acme/widgets#42`.
    async fn create_issue(&self, repository_reference: &str, issue: &IssueSpec) -> Result<String>;
}

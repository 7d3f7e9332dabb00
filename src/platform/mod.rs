pub mod github;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;
use types::RepoPullRequests;

/// Operations the daemon needs from the remote review service.
#[async_trait]
pub trait ReviewPlatform: Send + Sync {
    /// List open pull requests for a repository, with its id and clone URL.
    async fn list_open_pull_requests(&self, owner: &str, name: &str) -> Result<RepoPullRequests>;

    /// Post a comment on a pull request. Best effort: a failure is logged
    /// and reported as `None`; callers must not rely on the comment landing.
    async fn add_comment(&self, subject_id: &str, body: &str) -> Option<String>;

    /// Update an existing comment. Best effort: a failure is logged.
    async fn update_comment(&self, comment_id: &str, body: &str) -> bool;
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PullRequestState {
    Open,
    Closed,
    Merged,
}

/// Read-only snapshot of a pull request as returned by the review service.
///
/// Identity for retry bookkeeping is the triple
/// `(id, base_ref_oid, head_ref_oid)`: a change to either ref makes the
/// pull request new work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub id: String,
    pub title: String,
    pub state: PullRequestState,
    pub created_at: DateTime<Utc>,
    pub base_ref_name: String,
    pub base_ref_oid: String,
    pub head_ref_name: String,
    pub head_ref_oid: String,
}

/// Result of listing a repository's open pull requests.
#[derive(Debug, Clone)]
pub struct RepoPullRequests {
    pub repository_id: String,
    pub clone_url: String,
    pub pull_requests: Vec<PullRequest>,
}

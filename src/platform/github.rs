use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::GitHubConfig;
use crate::error::{AppError, Result};
use crate::platform::types::{PullRequest, RepoPullRequests};
use crate::platform::ReviewPlatform;

/// Fixed retry policy for transport failures.
const REQUEST_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);

const PULL_REQUESTS_QUERY: &str = r#"query($owner: String!, $name: String!) {
    repository(owner: $owner, name: $name) {
        id,
        sshUrl,
        pullRequests(last: 10, states: [OPEN]) {
            edges {
                node {
                    id,
                    title,
                    state,
                    createdAt,
                    baseRefName, baseRefOid,
                    headRefName, headRefOid
                }
            }
        }
    }
}"#;

const ADD_COMMENT_MUTATION: &str = r#"mutation($subjectId: ID!, $body: String!) {
    addComment(input: {
        subjectId: $subjectId,
        body: $body
    }) {
        commentEdge { node { id } }
    }
}"#;

const UPDATE_COMMENT_MUTATION: &str = r#"mutation($commentId: ID!, $body: String!) {
    updateIssueComment(input: {
        id: $commentId,
        body: $body
    }) {
        issueComment { id }
    }
}"#;

/// GraphQL client for the GitHub review service.
pub struct GitHubPlatform {
    client: Client,
    api_url: String,
    token: String,
}

impl GitHubPlatform {
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        if config.token.is_empty() {
            return Err(AppError::Config(
                "GitHub access token is not set (config or GITHUB_ACCESS_TOKEN)".to_string(),
            ));
        }
        Ok(Self {
            client: Client::new(),
            api_url: config.api_url.clone(),
            token: config.token.clone(),
        })
    }

    /// One GraphQL round trip.
    async fn request_once(&self, body: &Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Transport(format!("API returned {status}: {text}")));
        }

        let value: Value = response.json().await?;
        if let Some(errors) = value.get("errors") {
            return Err(AppError::Transport(format!("GraphQL errors: {errors}")));
        }
        Ok(value)
    }

    /// Round trip with the fixed retry policy; exhausting the attempts
    /// surfaces the last failure.
    async fn request(&self, body: &Value) -> Result<Value> {
        let mut last_err = AppError::Transport("no request attempts made".to_string());
        for attempt in 1..=REQUEST_ATTEMPTS {
            match self.request_once(body).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(
                        attempt = attempt,
                        of = REQUEST_ATTEMPTS,
                        error = %err,
                        "GitHub API request failed"
                    );
                    last_err = err;
                    if attempt < REQUEST_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    fn parse_listing(response: &Value) -> Result<RepoPullRequests> {
        let repository = response
            .pointer("/data/repository")
            .filter(|v| !v.is_null())
            .ok_or_else(|| AppError::Transport("repository missing from response".to_string()))?;

        let repository_id = repository
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let clone_url = repository
            .get("sshUrl")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut pull_requests = Vec::new();
        if let Some(edges) = repository
            .pointer("/pullRequests/edges")
            .and_then(Value::as_array)
        {
            for edge in edges {
                if let Some(node) = edge.get("node") {
                    let pr: PullRequest = serde_json::from_value(node.clone())?;
                    pull_requests.push(pr);
                }
            }
        }

        Ok(RepoPullRequests {
            repository_id,
            clone_url,
            pull_requests,
        })
    }
}

#[async_trait]
impl ReviewPlatform for GitHubPlatform {
    async fn list_open_pull_requests(&self, owner: &str, name: &str) -> Result<RepoPullRequests> {
        let body = json!({
            "query": PULL_REQUESTS_QUERY,
            "variables": { "owner": owner, "name": name },
        });
        let response = self.request(&body).await?;
        let listing = Self::parse_listing(&response)?;
        tracing::debug!(
            owner = owner,
            name = name,
            count = listing.pull_requests.len(),
            "Listed open pull requests"
        );
        Ok(listing)
    }

    async fn add_comment(&self, subject_id: &str, body: &str) -> Option<String> {
        let request = json!({
            "query": ADD_COMMENT_MUTATION,
            "variables": { "subjectId": subject_id, "body": body },
        });
        match self.request(&request).await {
            Ok(response) => {
                let id = response
                    .pointer("/data/addComment/commentEdge/node/id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                tracing::info!(subject = subject_id, comment = ?id, "Comment posted");
                id
            }
            Err(err) => {
                tracing::warn!(subject = subject_id, error = %err, "Failed to post comment");
                None
            }
        }
    }

    async fn update_comment(&self, comment_id: &str, body: &str) -> bool {
        let request = json!({
            "query": UPDATE_COMMENT_MUTATION,
            "variables": { "commentId": comment_id, "body": body },
        });
        match self.request(&request).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(comment = comment_id, error = %err, "Failed to update comment");
                false
            }
        }
    }
}

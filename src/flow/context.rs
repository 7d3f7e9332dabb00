use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const CONTEXT_FILE: &str = "context.json";

/// Bounded attempt history per flow; oldest records are evicted first.
const MAX_RECORDS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessOutcome {
    /// The handler reported success; terminal for this identity.
    Success,
    /// The handler reported a failed check.
    Failure,
    /// The handler itself errored out.
    Crashed,
}

/// Outcome of one processing attempt for a pull request identity.
/// Records are append-only; a new attempt appends a new record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub id: String,
    pub base_ref_oid: String,
    pub head_ref_oid: String,
    pub result: ProcessOutcome,
    pub attempt: u32,
}

impl PullRequestRecord {
    /// Whether this record is for the given identity. Any ref change makes
    /// a pull request new work for retry bookkeeping.
    pub fn matches(&self, id: &str, base_ref_oid: &str, head_ref_oid: &str) -> bool {
        self.id == id && self.base_ref_oid == base_ref_oid && self.head_ref_oid == head_ref_oid
    }
}

/// Durable per-flow state, one JSON document per flow working directory.
///
/// Loaded once when the flow engine starts and rewritten wholesale when it
/// stops; there is no incremental persistence.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FlowContext {
    #[serde(default)]
    pull_requests: Vec<PullRequestRecord>,
}

impl FlowContext {
    fn path(workdir: &Path) -> PathBuf {
        workdir.join(CONTEXT_FILE)
    }

    /// Load the context from a flow workdir. A missing file is not an
    /// error: the flow starts with an empty context.
    pub async fn load(workdir: &Path) -> Result<Self> {
        let path = Self::path(workdir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err.into()),
        };
        let context: FlowContext = serde_json::from_slice(&bytes)?;
        tracing::info!(
            path = %path.display(),
            records = context.pull_requests.len(),
            "Flow context loaded"
        );
        Ok(context)
    }

    /// Rewrite the whole document. A temp file plus rename keeps the
    /// on-disk copy whole if the daemon dies mid-write.
    pub async fn save(&self, workdir: &Path) -> Result<()> {
        let path = Self::path(workdir);
        let tmp = workdir.join(format!("{CONTEXT_FILE}.tmp"));
        let bytes = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::info!(
            path = %path.display(),
            records = self.pull_requests.len(),
            "Flow context saved"
        );
        Ok(())
    }

    /// Most recent record for a pull request id, regardless of refs.
    pub fn latest_for_id(&self, id: &str) -> Option<&PullRequestRecord> {
        self.pull_requests.iter().rev().find(|r| r.id == id)
    }

    /// Append a record, evicting the oldest beyond the history cap.
    pub fn push_record(&mut self, record: PullRequestRecord) {
        self.pull_requests.push(record);
        if self.pull_requests.len() > MAX_RECORDS {
            let excess = self.pull_requests.len() - MAX_RECORDS;
            self.pull_requests.drain(..excess);
        }
    }

    pub fn records(&self) -> &[PullRequestRecord] {
        &self.pull_requests
    }
}

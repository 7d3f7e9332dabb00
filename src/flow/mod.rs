pub mod context;
pub mod engine;

pub use context::{FlowContext, ProcessOutcome, PullRequestRecord};
pub use engine::FlowEngine;

use std::path::Path;

use async_trait::async_trait;

use crate::config::AppConfig;
use crate::error::Result;

/// One independently scheduled, periodically re-run unit of daemon work.
#[async_trait]
pub trait Flow: Send {
    fn name(&self) -> &str;

    /// Perform one unit of work. An error marks the iteration as failed
    /// without stopping the flow.
    async fn run_once(&mut self, context: &mut FlowContext) -> Result<()>;
}

/// Builds a flow bound to its private working directory.
pub type FlowFactory = Box<dyn Fn(&AppConfig, &Path) -> Result<Box<dyn Flow>> + Send + Sync>;

/// Entry in the ordered flow list assembled by the startup routine and
/// handed to the daemon's composition root.
pub struct FlowRegistration {
    pub name: &'static str,
    pub factory: FlowFactory,
}

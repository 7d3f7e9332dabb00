use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::flow::context::FlowContext;
use crate::flow::Flow;

/// Periodic driver for one flow.
///
/// Iteration failures are logged and the loop continues; a panic out of the
/// flow body is fatal for this flow only. Every exit path (cancellation or
/// fatal crash) persists the flow context before the task ends.
pub struct FlowEngine {
    workdir: PathBuf,
    delay: Duration,
    cancel: CancellationToken,
    context: FlowContext,
}

impl FlowEngine {
    /// Create an engine for a flow workdir, loading the durable context if
    /// one exists there.
    pub async fn new(
        workdir: PathBuf,
        delay: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let context = FlowContext::load(&workdir).await?;
        Ok(Self {
            workdir,
            delay,
            cancel,
            context,
        })
    }

    /// Drive the flow until cancellation or a fatal crash.
    pub async fn run(mut self, mut flow: Box<dyn Flow>) {
        let name = flow.name().to_string();
        let cancel = self.cancel.clone();
        tracing::info!(flow = %name, workdir = %self.workdir.display(), "Flow started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            tracing::debug!(flow = %name, "Run flow iteration...");
            let started = Instant::now();

            let body = AssertUnwindSafe(flow.run_once(&mut self.context)).catch_unwind();
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    // the in-flight iteration is dropped; kill-on-drop
                    // reclaims any process it was awaiting
                    tracing::info!(flow = %name, "Flow cancelled during iteration");
                    break;
                }
                result = body => result,
            };

            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(flow = %name, error = %err, "Flow iteration failed");
                }
                Err(_panic) => {
                    tracing::error!(flow = %name, "Flow crashed, stopping this flow");
                    break;
                }
            }

            tracing::info!(
                flow = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Flow iteration finished"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        if let Err(err) = self.context.save(&self.workdir).await {
            tracing::error!(flow = %name, error = %err, "Failed to save flow context");
        }
        tracing::info!(flow = %name, "Flow stopped");
    }
}

use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::process::sink::OutputSink;
use crate::process::supervisor::{LineStream, ManagedProcess};

/// Grace period for each stage of the terminate escalation when a command
/// overruns its deadline.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Per-invocation options: exit-code policy, deadline, and the destination
/// of each output stream.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Return the raw exit code instead of failing on non-zero exits.
    pub no_throw: bool,
    pub timeout: Option<Duration>,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

/// Stateless façade over `ManagedProcess` for one-shot command execution.
///
/// Every invocation logs the command line, working directory, pid, output
/// destinations, and final exit code. These records are the operational
/// audit trail for everything the daemon runs.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    /// Spawn a command without waiting for it.
    pub fn start(
        &self,
        args: &[String],
        workdir: Option<&Path>,
        opts: &ExecOptions,
    ) -> Result<ManagedProcess> {
        tracing::debug!(
            args = ?args,
            workdir = ?workdir,
            stdout = %opts.stdout,
            stderr = %opts.stderr,
            "Run command..."
        );
        ManagedProcess::spawn(args, workdir, opts.stdout.clone(), opts.stderr.clone())
    }

    /// Run a command to completion.
    ///
    /// On a wait timeout the process is put through the terminate escalation
    /// before the timeout error propagates, so the OS process is not leaked
    /// on that path.
    pub async fn execute(
        &self,
        args: &[String],
        workdir: Option<&Path>,
        opts: &ExecOptions,
    ) -> Result<i32> {
        let mut proc = self.start(args, workdir, opts)?;
        match proc.wait_with(opts.no_throw, opts.timeout).await {
            Ok(code) => {
                tracing::info!(args = ?args, pid = proc.pid(), code = code, "Command finished");
                Ok(code)
            }
            Err(err) if err.is_timeout() => {
                proc.terminate(TERMINATE_GRACE).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Run a command, returning a lazy sequence of separator-delimited
    /// stdout chunks. Exhausting the sequence waits for the process with
    /// the same timeout and exception policy.
    pub fn stream_lines(
        &self,
        args: &[String],
        workdir: Option<&Path>,
        separator: u8,
        opts: &ExecOptions,
    ) -> Result<LineStream> {
        let proc = self.start(args, workdir, opts)?;
        proc.into_line_stream(separator, opts.no_throw, opts.timeout)
    }
}

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::process::sink::{self, OutputSink};

/// How long to wait for drain tasks to flush after the child has exited.
/// A grandchild holding the inherited pipe open can keep a drain alive
/// past the child's own exit.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a supervised child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Terminating,
    Completed,
    Killed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Completed | ProcessState::Killed)
    }
}

/// One live or finished child process, owned exclusively by its creator.
///
/// The underlying child is configured with `kill_on_drop`, so dropping a
/// still-running `ManagedProcess` (including through future cancellation)
/// reclaims the OS process.
pub struct ManagedProcess {
    args: Vec<String>,
    workdir: Option<PathBuf>,
    pid: u32,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    stdout_sink: OutputSink,
    stderr_sink: OutputSink,
    drains: Vec<JoinHandle<()>>,
    exit_code: Option<i32>,
    state: ProcessState,
}

impl ManagedProcess {
    /// Spawn a child with stdin closed and both output streams captured.
    pub fn spawn(
        args: &[String],
        workdir: Option<&Path>,
        stdout_sink: OutputSink,
        stderr_sink: OutputSink,
    ) -> Result<Self> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| AppError::Spawn("empty argument vector".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::Spawn(format!("{program}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::Spawn("process exited before a pid was assigned".to_string()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        tracing::info!(
            args = ?args,
            workdir = ?workdir,
            pid = pid,
            "Process started"
        );

        Ok(Self {
            args: args.to_vec(),
            workdir: workdir.map(Path::to_path_buf),
            pid,
            child,
            stdout,
            stderr,
            stdout_sink,
            stderr_sink,
            drains: Vec::new(),
            exit_code: None,
            state: ProcessState::Running,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Set exactly once, when the process reaches a terminal state.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    fn spawn_stderr_drain(&mut self) {
        if let Some(stderr) = self.stderr.take() {
            self.drains
                .push(sink::drain(stderr, self.stderr_sink.clone(), self.pid, "stderr"));
        }
    }

    fn spawn_drains(&mut self) {
        if let Some(stdout) = self.stdout.take() {
            self.drains
                .push(sink::drain(stdout, self.stdout_sink.clone(), self.pid, "stdout"));
        }
        self.spawn_stderr_drain();
    }

    async fn join_drains(&mut self) {
        for mut handle in self.drains.drain(..) {
            if tokio::time::timeout(DRAIN_GRACE, &mut handle).await.is_err() {
                tracing::warn!(pid = self.pid, "Output drain did not finish, aborting it");
                handle.abort();
            }
        }
    }

    fn record_exit(&mut self, code: i32) {
        if self.exit_code.is_none() {
            self.exit_code = Some(code);
            self.state = ProcessState::Completed;
        }
    }

    /// Wait for the process to exit, draining both output streams to their
    /// sinks in the background so the child never blocks on a full pipe.
    ///
    /// Fails with `Timeout` if the deadline elapses first (the process keeps
    /// running), and with `NonZeroExit` on a failing exit code unless
    /// `no_throw` is set, in which case the raw code is returned.
    pub async fn wait_with(&mut self, no_throw: bool, timeout: Option<Duration>) -> Result<i32> {
        let code = match self.exit_code {
            Some(code) => code,
            None => {
                self.spawn_drains();
                let status = match with_timeout(self.child.wait(), timeout).await {
                    Ok(result) => result?,
                    Err(err) => {
                        tracing::warn!(
                            pid = self.pid,
                            timeout = ?timeout,
                            "Process did not finish before the deadline"
                        );
                        return Err(err);
                    }
                };
                let code = exit_code_of(status);
                self.record_exit(code);
                self.join_drains().await;
                tracing::info!(pid = self.pid, code = code, "Process finished");
                code
            }
        };

        if no_throw || code == 0 {
            Ok(code)
        } else {
            Err(AppError::NonZeroExit(code))
        }
    }

    /// Wait with the default exception policy: non-zero exit codes fail.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<i32> {
        self.wait_with(false, timeout).await
    }

    /// Consume the supervisor into a lazy, single-pass sequence of
    /// separator-delimited stdout chunks. The stderr drain starts before the
    /// first stdout read.
    pub fn into_line_stream(
        mut self,
        separator: u8,
        no_throw: bool,
        timeout: Option<Duration>,
    ) -> Result<LineStream> {
        self.spawn_stderr_drain();
        let stdout = self
            .stdout
            .take()
            .ok_or_else(|| AppError::Process("stdout already consumed".to_string()))?;
        Ok(LineStream {
            reader: BufReader::new(stdout),
            proc: self,
            separator,
            no_throw,
            timeout,
            eof: false,
            finished: false,
        })
    }

    fn send_term(&mut self) {
        #[cfg(unix)]
        // The pid stays valid while we hold the child handle; a stale pid
        // just makes kill(2) return ESRCH, which is ignored.
        unsafe {
            libc::kill(self.pid as i32, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        let _ = self.child.start_kill();
    }

    /// Two-stage shutdown: request graceful termination and wait up to
    /// `timeout`; if the process is still running, kill it and wait again.
    ///
    /// Returns the exit code if either stage succeeds. If the kill also does
    /// not complete in time the condition is logged and `None` is returned;
    /// the OS process may still be running.
    pub async fn terminate(&mut self, timeout: Duration) -> Option<i32> {
        if let Some(code) = self.exit_code {
            return Some(code);
        }

        self.state = ProcessState::Terminating;
        tracing::warn!(pid = self.pid, "Terminating process...");
        self.send_term();
        match self.wait_with(true, Some(timeout)).await {
            Ok(code) => return Some(code),
            Err(err) if err.is_timeout() => {
                tracing::warn!(pid = self.pid, "Process ignored termination, killing it...");
            }
            Err(err) => {
                tracing::warn!(pid = self.pid, error = %err, "Wait failed while terminating");
                return None;
            }
        }

        if let Err(err) = self.child.start_kill() {
            tracing::warn!(pid = self.pid, error = %err, "Kill request failed");
        }
        match self.wait_with(true, Some(timeout)).await {
            Ok(code) => {
                self.state = ProcessState::Killed;
                Some(code)
            }
            Err(err) => {
                tracing::error!(pid = self.pid, error = %err, "Could not kill process");
                None
            }
        }
    }
}

/// Lazy pull-based sequence of output chunks from a child's stdout.
///
/// A trailing partial chunk with no terminating separator is yielded once;
/// after the stream is exhausted the equivalent of `wait_with` runs with the
/// same timeout and exception policy, so the consumer of the last chunk
/// still observes exit-code failures.
pub struct LineStream {
    proc: ManagedProcess,
    reader: BufReader<ChildStdout>,
    separator: u8,
    no_throw: bool,
    timeout: Option<Duration>,
    eof: bool,
    finished: bool,
}

impl LineStream {
    pub fn pid(&self) -> u32 {
        self.proc.pid()
    }

    /// Next chunk, or `None` once the stream is exhausted and the exit code
    /// has been observed.
    pub async fn next_chunk(&mut self) -> Result<Option<String>> {
        if self.eof {
            return self.finish().await;
        }

        let mut buf = Vec::new();
        let read = self.reader.read_until(self.separator, &mut buf);
        let n = match with_timeout(read, self.timeout).await {
            Ok(result) => result?,
            Err(err) => {
                tracing::warn!(pid = self.proc.pid(), "Timed out reading process output");
                return Err(err);
            }
        };
        if n == 0 {
            self.eof = true;
            return self.finish().await;
        }

        if buf.last() == Some(&self.separator) {
            buf.pop();
        } else {
            // trailing chunk without a separator: yield it, then stop
            self.eof = true;
        }

        let chunk = String::from_utf8_lossy(&buf).into_owned();
        tracing::debug!(pid = self.proc.pid(), stream = "stdout", "{chunk}");
        Ok(Some(chunk))
    }

    async fn finish(&mut self) -> Result<Option<String>> {
        if !self.finished {
            self.finished = true;
            self.proc.wait_with(self.no_throw, self.timeout).await?;
        }
        Ok(None)
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

async fn with_timeout<F, T>(future: F, timeout: Option<Duration>) -> Result<std::io::Result<T>>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match timeout {
        None => Ok(future.await),
        Some(duration) => tokio::time::timeout(duration, future)
            .await
            .map_err(|_| AppError::Timeout(duration)),
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn spawn(script: &str) -> ManagedProcess {
        ManagedProcess::spawn(&sh(script), None, OutputSink::Null, OutputSink::Null).unwrap()
    }

    async fn collect(stream: &mut LineStream) -> Vec<String> {
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let args = vec!["definitely-not-a-command-xyz".to_string()];
        let result = ManagedProcess::spawn(&args, None, OutputSink::Null, OutputSink::Null);
        assert!(matches!(result, Err(AppError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_spawn_empty_args() {
        let result = ManagedProcess::spawn(&[], None, OutputSink::Null, OutputSink::Null);
        assert!(matches!(result, Err(AppError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_wait_success() {
        let mut proc = spawn("exit 0");
        let code = proc.wait(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(proc.exit_code(), Some(0));
        assert!(proc.state().is_terminal());
    }

    #[tokio::test]
    async fn test_wait_nonzero_exit() {
        let mut proc = spawn("exit 2");
        let err = proc.wait(Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, AppError::NonZeroExit(2)));
        // the exit was still recorded exactly once
        assert_eq!(proc.exit_code(), Some(2));
    }

    #[tokio::test]
    async fn test_wait_no_throw_returns_raw_code() {
        let mut proc = spawn("exit 2");
        let code = proc
            .wait_with(true, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(code, 2);
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_process_running() {
        let mut proc = spawn("sleep 5");
        let err = proc
            .wait(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(proc.exit_code(), None);
        assert_eq!(proc.state(), ProcessState::Running);

        let code = proc.terminate(Duration::from_secs(2)).await;
        assert!(code.is_some());
        assert!(proc.state().is_terminal());
    }

    #[tokio::test]
    async fn test_stream_yields_trailing_chunk() {
        let proc = spawn("printf 'a\\nb\\nc'");
        let mut stream = proc
            .into_line_stream(b'\n', false, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(collect(&mut stream).await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stream_with_trailing_separator() {
        let proc = spawn("printf 'a\\nb\\n'");
        let mut stream = proc
            .into_line_stream(b'\n', false, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(collect(&mut stream).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_stream_surfaces_exit_failure_after_last_chunk() {
        let proc = spawn("printf 'x\\n'; exit 3");
        let mut stream = proc
            .into_line_stream(b'\n', false, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(stream.next_chunk().await.unwrap(), Some("x".to_string()));
        let err = stream.next_chunk().await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        // exhausted stream stays exhausted
        assert_eq!(stream.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let mut proc = spawn("sleep 30");
        let code = proc.terminate(Duration::from_secs(2)).await;
        assert!(code.is_some());
        assert_eq!(proc.state(), ProcessState::Completed);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        // The child ignores SIGTERM, so only the kill stage can reap it.
        let mut proc = spawn("trap '' TERM; while true; do sleep 0.1; done");
        let code = proc.terminate(Duration::from_millis(300)).await;
        assert!(code.is_some());
        assert_eq!(proc.state(), ProcessState::Killed);
        assert!(proc.exit_code().is_some());
    }
}

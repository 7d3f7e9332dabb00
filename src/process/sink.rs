use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;

/// Destination for one output stream of a child process, chosen per
/// invocation for stdout and stderr independently.
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    /// Emit each line as a structured log record tagged with pid and stream.
    #[default]
    Log,
    /// Discard the stream.
    Null,
    /// Append raw bytes to a file.
    File(PathBuf),
    /// Append raw bytes to a shared in-memory buffer.
    Memory(Arc<Mutex<Vec<u8>>>),
}

impl std::fmt::Display for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSink::Log => write!(f, "log"),
            OutputSink::Null => write!(f, "null"),
            OutputSink::File(path) => write!(f, "file:{}", path.display()),
            OutputSink::Memory(_) => write!(f, "memory"),
        }
    }
}

/// Spawn a background task that consumes `reader` until end of stream,
/// routing everything into `sink`. The child is never blocked on a full
/// pipe while one of these is running.
pub(crate) fn drain<R>(
    reader: R,
    sink: OutputSink,
    pid: u32,
    stream: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        match sink {
            OutputSink::Log => {
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(pid = pid, stream = stream, "{line}");
                }
            }
            OutputSink::Null => {
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
            }
            OutputSink::File(path) => {
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await;
                match file {
                    Ok(mut file) => {
                        let _ = tokio::io::copy(&mut reader, &mut file).await;
                    }
                    Err(err) => {
                        tracing::warn!(
                            pid = pid,
                            stream = stream,
                            path = %path.display(),
                            error = %err,
                            "Failed to open sink file, discarding output"
                        );
                        let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                    }
                }
            }
            OutputSink::Memory(buffer) => {
                let mut chunk = [0u8; 4096];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut guard) = buffer.lock() {
                                guard.extend_from_slice(&chunk[..n]);
                            }
                        }
                    }
                }
            }
        }
    })
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Timed out after {0:?} waiting for process")]
    Timeout(std::time::Duration),

    #[error("Process exited with code {0}")]
    NonZeroExit(i32),

    #[error("GitHub API request failed: {0}")]
    Transport(String),

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Exit code carried by a `NonZeroExit`, if that is what this error is.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            AppError::NonZeroExit(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

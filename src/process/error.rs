use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Result type for process operations
pub type ProcessResult<T> = std::result::Result<T, ProcessError>;

/// Errors that can occur during process operations
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    SpawnError(#[from] io::Error),

    #[error("Process exited with non-zero status: {0}")]
    NonZeroExit(ExitStatus),

    #[error("Process timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to read from process: {0}")]
    ReadError(io::Error),
}

impl From<ProcessError> for crate::error::AgentError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Timeout(limit) => {
                crate::error::AgentError::Timeout(format!("process ran longer than {:?}", limit))
            }
            other => crate::error::AgentError::Process(other.to_string()),
        }
    }
}

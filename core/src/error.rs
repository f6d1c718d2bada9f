use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid task state: {0}")]
    InvalidState(String),
    #[error("engine already initialized")]
    AlreadyInitialized,
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("transfer failed: {message}")]
    TransferFailed {
        status: Option<u16>,
        message: String,
    },
    #[error("task cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn transfer(message: impl Into<String>) -> Self {
        CoreError::TransferFailed {
            status: None,
            message: message.into(),
        }
    }

    pub fn http_status(status: u16) -> Self {
        CoreError::TransferFailed {
            status: Some(status),
            message: format!("server responded with status {}", status),
        }
    }

    /// Maps an I/O error raised while streaming, keeping timeouts distinct.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                CoreError::Timeout(err.to_string())
            }
            _ => CoreError::transfer(err.to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidArgument(_) => "invalid_argument",
            CoreError::InvalidState(_) => "invalid_state",
            CoreError::AlreadyInitialized => "already_initialized",
            CoreError::Timeout(_) => "timeout",
            CoreError::TransferFailed { .. } => "transfer_failed",
            CoreError::Cancelled => "cancelled",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("Already attempting to connect.")]
    AlreadyConnecting,
    #[error("connection to {host}:{port} failed after {attempts} attempt(s): {message}")]
    ConnectFailed {
        host: String,
        port: u16,
        attempts: u32,
        message: String,
    },
    #[error("connect cancelled")]
    Cancelled,
    #[error("target connection closed")]
    Closed,
    #[error("target I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TargetError {
    /// Errors that end the target but leave the session usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }
}

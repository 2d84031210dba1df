use thiserror::Error;

/// Errors from loading or validating [`crate::PassthroughSettings`].
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid (e.g., out of range).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Rejections from updating the live default target.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("IP address and port are required")]
    MissingField,
    #[error("Invalid IP address format")]
    InvalidIp(String),
    #[error("Port must be a number between 1 and 65535")]
    InvalidPort(String),
}

/// A client frame that claimed to be an envelope but could not be used.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid target configuration: {0}")]
    InvalidTarget(String),
    #[error("Invalid data payload: {0}")]
    InvalidData(String),
}

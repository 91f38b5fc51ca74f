use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VidsyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    /// Rejected synchronously: bad job type, out-of-range interval, bad filter.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation was refused because of current system state.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Logging setup failed: {0}")]
    Telemetry(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

impl VidsyncError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        VidsyncError::InvalidArgument(message.into())
    }
}

pub type Result<T> = std::result::Result<T, VidsyncError>;

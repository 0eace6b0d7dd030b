// error.rs - Centralized error handling using thiserror

use serde::{Deserialize, Serialize};

/// Application-wide Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sync kernel
///
/// Uses thiserror for ergonomic error handling and automatic Display impl.
/// All errors are serializable for safe transmission to the UI shell.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Process exit code for CLI wrappers.
    ///
    /// 0 is success. 3 (conflict requires attention) is never produced
    /// here: the kernel records conflicts in the store instead of raising
    /// them, so a wrapper derives that code from the open-conflict
    /// counters.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_) => 2,
            Error::Network(_) | Error::Transport(_) | Error::Cancelled(_) => 4,
            Error::Database(_) => 5,
            _ => 1,
        }
    }

    /// Whether the failure is network-classified (drives the OFFLINE status).
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Cancelled(_))
    }
}

// Implement conversions from common error types
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Cancelled(format!("Request timed out: {}", err))
        } else if err.is_connect() || err.is_request() {
            Error::Network(err.to_string())
        } else {
            Error::Transport(err.to_string())
        }
    }
}

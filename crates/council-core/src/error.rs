//! Error types for the Council core library.

use thiserror::Error;

/// Result type alias using Council core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Council operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Flow configuration error (bad step, duplicate/reserved key, bad command)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid character limit or limit environment variable
    #[error("Invalid limit: {0}")]
    Limit(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

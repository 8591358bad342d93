//! Error types for agentdeck core library.

use thiserror::Error;

/// Result type alias using agentdeck Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for agentdeck operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Agent stream line could not be parsed as a structured message
    #[error("Failed to parse agent message: {0}")]
    StreamParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

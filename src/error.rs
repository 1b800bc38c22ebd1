//! Error types for Akatsuki.

use thiserror::Error;

/// Common error type for Akatsuki.
#[derive(Error, Debug)]
pub enum AkatsukiError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation error for user input or configuration values.
    #[error("validation error: {0}")]
    Validation(String),

    /// Moderation snapshot could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// External completion service failure.
    #[error("completion error: {0}")]
    Completion(String),
}

/// Result type alias for Akatsuki operations.
pub type Result<T> = std::result::Result<T, AkatsukiError>;

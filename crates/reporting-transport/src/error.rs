//! Transport error types.

use thiserror::Error;

/// Transport error type.
#[derive(Error, Debug)]
pub enum TransportError {
    /// HTTP client construction failed
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Path has no parent directory or file name
    #[error("Invalid state path: {0}")]
    InvalidPath(String),
}

/// Result type alias using TransportError.
pub type TransportResult<T> = Result<T, TransportError>;

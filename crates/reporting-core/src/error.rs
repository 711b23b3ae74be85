//! Reporting error types.

use crate::types::Origin;
use thiserror::Error;

/// Reporting error type.
#[derive(Error, Debug)]
pub enum ReportingError {
    /// No eviction could free a slot for the new item
    #[error("Capacity exceeded for origin {origin}")]
    CapacityExceeded { origin: Origin },

    /// URL does not have a tuple origin (e.g. `data:` or `file:`)
    #[error("Invalid origin: {0}")]
    InvalidOrigin(String),

    /// Malformed `Report-To` header
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Delegate load/store failure
    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Result type alias using ReportingError.
pub type ReportingResult<T> = Result<T, ReportingError>;

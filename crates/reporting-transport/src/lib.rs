//! Host-side collaborators for `reporting-core`.
//!
//! This crate provides:
//! - HttpUploader: `reqwest` uploader that maps HTTP status to upload outcomes
//! - FileDelegate: persisted state in a single file, replaced atomically

mod error;
mod file_delegate;
mod http_uploader;

pub use error::{TransportError, TransportResult};
pub use file_delegate::FileDelegate;
pub use http_uploader::{classify_status, HttpUploader, UploaderConfig, REPORTS_CONTENT_TYPE};

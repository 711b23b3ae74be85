//! # reporting-core
//!
//! Client-side report delivery: origins register reporting endpoints,
//! upstream code queues reports, and the delivery agent uploads them in
//! batches with per-endpoint backoff, best effort.
//!
//! ## Principles
//!
//! - **One lock** - All cache and endpoint manager mutations happen under a
//!   single mutex; only uploads run outside it
//! - **Bounded memory** - Reports and endpoints are capped globally and per
//!   origin; eviction is oldest-first and never touches in-flight reports
//! - **Injected time** - Wall clock for ages and expiry, monotonic ticks for
//!   backoff, both from a [`Clock`]
//! - **Best effort** - Failures never reach report originators; reports are
//!   dropped silently after their attempts run out
//!
//! ## Architecture
//!
//! ```text
//! queue_report ──▶ ReportingCache ◀── EndpointManager
//!                        │                  ▲
//!                        ▼                  │ outcome
//!                  DeliveryAgent ──▶ ReportingUploader
//!                        │
//!                        ▼
//!                ReportingDelegate (periodic persist)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use reporting_core::{
//!     Collaborators, EndpointRegistration, InMemoryDelegate, Origin, ReportingContext,
//!     ReportingPolicy, ReportingUploader, UploadOutcome,
//! };
//! use std::sync::Arc;
//! use url::Url;
//!
//! struct AcceptAll;
//!
//! #[async_trait::async_trait]
//! impl ReportingUploader for AcceptAll {
//!     async fn upload(&self, _url: &Url, _payload: String) -> UploadOutcome {
//!         UploadOutcome::Success
//!     }
//! }
//!
//! # async fn demo() -> reporting_core::ReportingResult<()> {
//! let context = ReportingContext::new(
//!     ReportingPolicy::default(),
//!     Collaborators::new(Arc::new(AcceptAll), Arc::new(InMemoryDelegate::new())),
//! );
//!
//! let page = Url::parse("https://site.example/page")?;
//! context.register_endpoint(EndpointRegistration::new(
//!     Origin::from_url(&page)?,
//!     "default",
//!     Url::parse("https://collector.example/reports")?,
//! ))?;
//! context.queue_report(&page, "default", "deprecation", serde_json::json!({"id": "x"}))?;
//!
//! context.deliver_now();
//! context.wait_for_uploads().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod context;
pub mod delegate;
pub mod delivery_agent;
pub mod endpoint_manager;
mod error;
pub mod header;
pub mod observer;
pub mod persistence;
pub mod policy;
pub mod types;
pub mod uploader;

#[cfg(test)]
mod tests;

pub use cache::{EvictionSummary, FailureSummary, ReportingCache};
pub use clock::{Clock, ManualClock, SystemClock, Ticks};
pub use context::{Collaborators, DataTypes, RemovalSummary, ReportingContext};
pub use delegate::{InMemoryDelegate, NullDelegate, ReportingDelegate};
pub use delivery_agent::{DeliveryAgent, ReportingState, RoundSummary};
pub use endpoint_manager::{backoff_delay, EndpointManager};
pub use error::{ReportingError, ReportingResult};
pub use header::{parse_report_to, EndpointGroupHeader, EndpointHeader, DEFAULT_GROUP};
pub use observer::{CacheEvent, CacheObserver, NullObserver, RecordingObserver, RemovalReason};
pub use persistence::{PersistedState, RestoreSummary};
pub use policy::ReportingPolicy;
pub use types::{
    BackoffState, Destination, EndpointClient, EndpointKey, EndpointRegistration, NewReport,
    Origin, Report, ReportId, ReportStatus,
};
pub use uploader::{serialize_reports, ReportingUploader, UploadOutcome};

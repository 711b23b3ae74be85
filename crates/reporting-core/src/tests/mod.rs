//! Scenario tests for the reporting pipeline.
//!
//! - `eviction.rs`    - capacity limits and oldest-first eviction
//! - `ordering.rs`    - creation-order delivery and no duplicate delivery
//! - `backoff.rs`     - endpoint backoff driven through delivery rounds
//! - `lifecycle.rs`   - report status transitions end to end
//! - `concurrency.rs` - per-endpoint serialization and fan-out
//! - `recovery.rs`    - persistence, restart and shutdown
//! - `service.rs`     - headers, browsing-data removal, network changes, loops

mod concurrency;
mod eviction;
mod lifecycle;

use crate::policy::ReportingPolicy;
use crate::types::ReportStatus;
use crate::uploader::UploadOutcome;
use harness::Harness;

/// Register, queue, deliver, acknowledge.
#[tokio::test]
async fn basic_workflow() {
    let h = Harness::new(ReportingPolicy::default());
    h.register("https://site.example", "https://collector.example/up");
    let id = h.queue("https://site.example");

    let summary = h.context.deliver_now();
    assert_eq!(summary.uploads_started, 1);
    assert_eq!(h.status(&id), Some(ReportStatus::InFlight));

    let upload = h.uploader.next_upload().await;
    assert_eq!(upload.url.as_str(), "https://collector.example/up");
    assert_eq!(upload.report_count(), 1);
    h.finish(upload, UploadOutcome::Success).await;

    assert_eq!(h.status(&id), Some(ReportStatus::Delivered));
    assert_eq!(h.context.pending_uploads(), 0);
}

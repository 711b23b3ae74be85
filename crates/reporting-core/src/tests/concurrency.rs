//! Tests for upload concurrency.
//!
//! These tests verify that:
//! - At most one upload is outstanding per endpoint
//! - Uploads to distinct endpoints run concurrently
//! - Fan-out is bounded by max_concurrent_uploads

use super::harness::Harness;
use crate::policy::ReportingPolicy;
use crate::types::ReportStatus;
use crate::uploader::UploadOutcome;

#[tokio::test]
async fn one_outstanding_upload_per_endpoint() {
    let h = Harness::new(ReportingPolicy::default());
    h.register("https://a.example", "https://collector.example/up");
    h.queue("https://a.example");
    h.context.deliver_now();
    let upload = h.uploader.next_upload().await;

    let late = h.queue("https://a.example");
    let summary = h.context.deliver_now();
    assert_eq!(summary.uploads_started, 0);
    assert_eq!(summary.skipped_no_endpoint, 1);
    assert_eq!(h.status(&late), Some(ReportStatus::Queued));
    assert_eq!(h.context.pending_uploads(), 1);

    h.finish(upload, UploadOutcome::Success).await;

    assert_eq!(h.context.deliver_now().uploads_started, 1);
    let upload = h.uploader.next_upload().await;
    assert_eq!(upload.report_count(), 1);
    h.finish(upload, UploadOutcome::Success).await;
    assert_eq!(h.status(&late), Some(ReportStatus::Delivered));
}

#[tokio::test]
async fn distinct_endpoints_upload_concurrently() {
    let h = Harness::new(ReportingPolicy::default());
    h.register("https://a.example", "https://one.example/up");
    h.register("https://b.example", "https://two.example/up");
    let a = h.queue("https://a.example");
    let b = h.queue("https://b.example");

    assert_eq!(h.context.deliver_now().uploads_started, 2);
    let first = h.uploader.next_upload().await;
    let second = h.uploader.next_upload().await;
    assert_eq!(h.context.pending_uploads(), 2);

    // Completion order is independent of start order.
    second.complete(UploadOutcome::Success);
    first.complete(UploadOutcome::RetryableFailure);
    h.context.wait_for_uploads().await;

    let statuses = [h.status(&a).unwrap(), h.status(&b).unwrap()];
    assert!(statuses.contains(&ReportStatus::Delivered));
    assert!(statuses.contains(&ReportStatus::Queued));
    assert_eq!(h.context.pending_uploads(), 0);
}

#[tokio::test]
async fn destinations_sharing_an_endpoint_share_one_upload() {
    let h = Harness::new(ReportingPolicy::default());
    let key_a = h.register("https://a.example", "https://collector.example/up");
    let key_b = h.register("https://b.example", "https://collector.example/up");
    h.queue("https://a.example");
    h.queue("https://b.example");

    let summary = h.context.deliver_now();
    assert_eq!(summary.destinations, 2);
    assert_eq!(summary.uploads_started, 1);
    let upload = h.uploader.next_upload().await;
    assert_eq!(upload.report_count(), 2);
    h.finish(upload, UploadOutcome::RetryableFailure).await;

    // Both endpoint clients are penalized.
    h.context.with_cache(|cache| {
        assert_eq!(cache.endpoint(&key_a).unwrap().backoff.consecutive_failures, 1);
        assert_eq!(cache.endpoint(&key_b).unwrap().backoff.consecutive_failures, 1);
    });
}

#[tokio::test]
async fn fan_out_is_bounded() {
    let policy = ReportingPolicy {
        max_concurrent_uploads: 2,
        ..Default::default()
    };
    let h = Harness::new(policy);
    for (origin, endpoint) in [
        ("https://a.example", "https://one.example/up"),
        ("https://b.example", "https://two.example/up"),
        ("https://c.example", "https://three.example/up"),
    ] {
        h.register(origin, endpoint);
        h.queue(origin);
    }

    let summary = h.context.deliver_now();
    assert_eq!(summary.uploads_started, 2);
    assert_eq!(summary.deferred, 1);

    // A full pipeline starts nothing new.
    let summary = h.context.deliver_now();
    assert_eq!(summary.uploads_started, 0);

    let first = h.uploader.next_upload().await;
    let second = h.uploader.next_upload().await;
    first.complete(UploadOutcome::Success);
    second.complete(UploadOutcome::Success);
    h.context.wait_for_uploads().await;

    assert_eq!(h.context.deliver_now().uploads_started, 1);
    let third = h.uploader.next_upload().await;
    h.finish(third, UploadOutcome::Success).await;
    assert_eq!(
        h.context
            .with_cache(|cache| cache.count_with_status(ReportStatus::Queued)),
        0
    );
}

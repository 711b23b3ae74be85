//! Tests for report status transitions.

use super::harness::Harness;
use crate::observer::{CacheEvent, RemovalReason};
use crate::policy::ReportingPolicy;
use crate::types::ReportStatus;
use crate::uploader::UploadOutcome;
use std::time::Duration;

#[tokio::test]
async fn delivered_report_is_swept_by_next_maintenance_pass() {
    let h = Harness::new(ReportingPolicy::default());
    let key = h.register("https://a.example", "https://collector.example/up");
    let id = h.queue("https://a.example");

    h.context.deliver_now();
    let upload = h.uploader.next_upload().await;
    h.finish(upload, UploadOutcome::Success).await;

    assert_eq!(h.status(&id), Some(ReportStatus::Delivered));
    let backoff = h
        .context
        .with_cache(|cache| cache.endpoint(&key).unwrap().backoff.clone());
    assert_eq!(backoff.consecutive_failures, 0);
    assert_eq!(backoff.next_eligible, None);

    let summary = h.context.collect_garbage();
    assert_eq!(summary.reports, 1);
    assert_eq!(h.status(&id), None);
    assert_eq!(
        h.observer.removed_reports(RemovalReason::Delivered),
        vec![id]
    );
}

#[tokio::test]
async fn two_retryable_failures_discard_with_max_attempts_two() {
    let policy = ReportingPolicy {
        max_attempts: 2,
        backoff_base: Duration::from_secs(1),
        ..Default::default()
    };
    let h = Harness::new(policy);
    h.register("https://a.example", "https://collector.example/up");
    let id = h.queue("https://a.example");

    let mut observed = vec![h.status(&id).unwrap()];

    h.context.deliver_now();
    observed.push(h.status(&id).unwrap());
    let upload = h.uploader.next_upload().await;
    h.finish(upload, UploadOutcome::RetryableFailure).await;
    observed.push(h.status(&id).unwrap());
    assert_eq!(h.attempts(&id), 1);

    h.clock.advance(Duration::from_secs(1));
    h.context.deliver_now();
    observed.push(h.status(&id).unwrap());
    let upload = h.uploader.next_upload().await;
    h.finish(upload, UploadOutcome::RetryableFailure).await;
    observed.push(h.status(&id).unwrap());

    assert_eq!(
        observed,
        vec![
            ReportStatus::Queued,
            ReportStatus::InFlight,
            ReportStatus::Queued,
            ReportStatus::InFlight,
            ReportStatus::Discarded,
        ]
    );
    assert_eq!(h.attempts(&id), 2);

    // Discarded reports never re-enter Queued.
    h.clock.advance(Duration::from_secs(10));
    h.context.deliver_now();
    assert!(h.uploader.try_next_upload().is_none());
    assert_eq!(
        h.observer.removed_reports(RemovalReason::Discarded),
        vec![id]
    );
}

#[tokio::test]
async fn reports_expire_after_max_age() {
    let h = Harness::new(ReportingPolicy::default());
    let id = h.queue("https://a.example");

    h.clock.advance(Duration::from_secs(15 * 60));
    h.context.collect_garbage();
    assert_eq!(h.status(&id), Some(ReportStatus::Queued));

    h.clock.advance(Duration::from_secs(1));
    h.context.collect_garbage();
    assert_eq!(h.status(&id), None);
    assert_eq!(h.observer.removed_reports(RemovalReason::Expired), vec![id]);
}

#[tokio::test]
async fn in_flight_report_outlives_max_age() {
    let h = Harness::new(ReportingPolicy::default());
    h.register("https://a.example", "https://collector.example/up");
    let id = h.queue("https://a.example");
    h.context.deliver_now();
    let upload = h.uploader.next_upload().await;

    h.clock.advance(Duration::from_secs(60 * 60));
    h.context.collect_garbage();
    assert_eq!(h.status(&id), Some(ReportStatus::InFlight));

    // Re-queued but too old: swept on the next pass.
    h.finish(upload, UploadOutcome::RetryableFailure).await;
    assert_eq!(h.status(&id), Some(ReportStatus::Queued));
    h.context.collect_garbage();
    assert_eq!(h.status(&id), None);
}

#[tokio::test]
async fn cache_events_follow_the_lifecycle() {
    let h = Harness::new(ReportingPolicy::default());
    h.register("https://a.example", "https://collector.example/up");
    h.observer.clear();

    let id = h.queue("https://a.example");
    h.context.deliver_now();
    let upload = h.uploader.next_upload().await;
    h.finish(upload, UploadOutcome::Success).await;

    let events = h.observer.events();
    assert_eq!(events[0], CacheEvent::ReportQueued { id });
    assert!(events[1..]
        .iter()
        .all(|event| matches!(event, CacheEvent::ReportsUpdated { count: 1 })));
    assert_eq!(events.len(), 3);
}

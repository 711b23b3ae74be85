//! Tests for capacity limits.
//!
//! These tests verify that:
//! - The oldest non-InFlight report of an origin is evicted first
//! - InFlight reports are never evicted
//! - A full cache of InFlight reports rejects new reports

use super::harness::Harness;
use crate::error::ReportingError;
use crate::observer::RemovalReason;
use crate::policy::ReportingPolicy;
use crate::types::ReportStatus;
use crate::uploader::UploadOutcome;
use std::time::Duration;

fn small_policy() -> ReportingPolicy {
    ReportingPolicy {
        max_reports_per_origin: 2,
        ..Default::default()
    }
}

#[tokio::test]
async fn third_report_evicts_oldest() {
    let h = Harness::new(small_policy());

    let first = h.queue("https://a.example");
    h.clock.advance(Duration::from_secs(1));
    let second = h.queue("https://a.example");
    h.clock.advance(Duration::from_secs(1));
    let third = h.queue("https://a.example");

    h.context.with_cache(|cache| {
        assert_eq!(cache.report_count(), 2);
        assert!(cache.report(&first).is_none());
        assert!(cache.report(&second).is_some());
        assert!(cache.report(&third).is_some());
    });
    assert_eq!(
        h.observer.removed_reports(RemovalReason::Capacity),
        vec![first]
    );
}

#[tokio::test]
async fn eviction_sequence_is_oldest_first() {
    let h = Harness::new(small_policy());
    let mut queued = Vec::new();
    for _ in 0..6 {
        queued.push(h.queue("https://a.example"));
        h.clock.advance(Duration::from_millis(10));
    }

    assert_eq!(
        h.observer.removed_reports(RemovalReason::Capacity),
        queued[..4].to_vec()
    );
}

#[tokio::test]
async fn in_flight_report_survives_origin_pressure() {
    let h = Harness::new(small_policy());
    h.register("https://a.example", "https://collector.example/up");

    let in_flight = h.queue("https://a.example");
    h.context.deliver_now();
    let upload = h.uploader.next_upload().await;

    for _ in 0..4 {
        h.clock.advance(Duration::from_secs(1));
        h.queue("https://a.example");
    }

    assert_eq!(h.status(&in_flight), Some(ReportStatus::InFlight));
    assert_eq!(
        h.context
            .with_cache(|cache| cache.count_with_status(ReportStatus::Queued)),
        1
    );
    assert!(!h
        .observer
        .removed_reports(RemovalReason::Capacity)
        .contains(&in_flight));

    h.finish(upload, UploadOutcome::Success).await;
}

#[tokio::test]
async fn all_in_flight_rejects_new_reports() {
    let policy = ReportingPolicy {
        max_reports: 2,
        max_reports_per_origin: 2,
        ..Default::default()
    };
    let h = Harness::new(policy);
    h.register("https://a.example", "https://collector.example/up");
    h.queue("https://a.example");
    h.queue("https://a.example");
    h.context.deliver_now();
    let upload = h.uploader.next_upload().await;

    let rejected = h.try_queue("https://a.example");
    assert!(matches!(
        rejected,
        Err(ReportingError::CapacityExceeded { .. })
    ));
    let rejected = h.try_queue("https://b.example");
    assert!(matches!(
        rejected,
        Err(ReportingError::CapacityExceeded { .. })
    ));

    h.finish(upload, UploadOutcome::Success).await;
    // Delivered reports can be evicted to make room.
    assert!(h.try_queue("https://b.example").is_ok());
}

#[tokio::test]
async fn global_cap_evicts_across_origins() {
    let policy = ReportingPolicy {
        max_reports: 3,
        ..Default::default()
    };
    let h = Harness::new(policy);

    let oldest = h.queue("https://a.example");
    h.clock.advance(Duration::from_secs(1));
    h.queue("https://b.example");
    h.clock.advance(Duration::from_secs(1));
    h.queue("https://c.example");
    h.clock.advance(Duration::from_secs(1));
    h.queue("https://d.example");

    assert_eq!(h.context.with_cache(|cache| cache.report_count()), 3);
    assert_eq!(h.status(&oldest), None);
}

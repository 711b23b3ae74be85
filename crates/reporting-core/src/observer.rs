//! Cache observer contracts.
//!
//! The cache emits an event after each committed mutation. Observers decide
//! what the events mean; tests assert emission.

use crate::types::{EndpointKey, ReportId};

/// Why a report or endpoint left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Delivered and swept by the maintenance pass.
    Delivered,
    /// Discarded and swept by the maintenance pass.
    Discarded,
    /// Older than the report age limit, or endpoint past its TTL/staleness.
    Expired,
    /// Evicted to make room for a newer entry.
    Capacity,
    /// Removed on request (unregistration, browsing-data removal, network change).
    Cleared,
    /// Endpoint disabled after too many consecutive failures.
    Disabled,
}

/// An event emitted by the cache after committing a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A report was queued.
    ReportQueued { id: ReportId },
    /// Reports changed delivery status.
    ReportsUpdated { count: usize },
    /// A report was removed.
    ReportRemoved { id: ReportId, reason: RemovalReason },
    /// An endpoint was registered or refreshed.
    EndpointUpserted { key: EndpointKey },
    /// An endpoint was removed.
    EndpointRemoved { key: EndpointKey, reason: RemovalReason },
}

/// A sink that receives cache events.
pub trait CacheObserver: Send + Sync {
    /// Called with the cache lock held; implementations must not block.
    fn on_cache_event(&self, event: CacheEvent);
}

/// An observer that discards all events.
#[derive(Debug, Default)]
pub struct NullObserver;

impl CacheObserver for NullObserver {
    fn on_cache_event(&self, _event: CacheEvent) {}
}

/// An observer that records all events for testing.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: parking_lot::Mutex<Vec<CacheEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded events.
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().clone()
    }

    /// Clears all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of removed reports with the given reason, in removal order.
    pub fn removed_reports(&self, reason: RemovalReason) -> Vec<ReportId> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CacheEvent::ReportRemoved { id, reason: r } if *r == reason => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl CacheObserver for RecordingObserver {
    fn on_cache_event(&self, event: CacheEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_observer_records_events() {
        let observer = RecordingObserver::new();
        assert!(observer.is_empty());

        let id = ReportId::new();
        observer.on_cache_event(CacheEvent::ReportQueued { id });
        observer.on_cache_event(CacheEvent::ReportRemoved {
            id,
            reason: RemovalReason::Capacity,
        });

        assert_eq!(observer.len(), 2);
        assert_eq!(observer.removed_reports(RemovalReason::Capacity), vec![id]);
        assert!(observer.removed_reports(RemovalReason::Expired).is_empty());

        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn null_observer_discards_events() {
        NullObserver.on_cache_event(CacheEvent::ReportsUpdated { count: 1 });
    }
}

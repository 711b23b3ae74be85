//! Report and endpoint cache.
//!
//! The cache exclusively owns the queued reports and the registered endpoint
//! clients. Reports are indexed three ways so that `add_report` stays
//! O(log n):
//!
//! - globally, oldest first, among non-InFlight reports (capacity eviction)
//! - per origin, oldest first, among non-InFlight reports (origin eviction)
//! - per destination, oldest first, among Queued reports (delivery)
//!
//! Every mutation marks the cache dirty for the next persistence cycle and
//! emits a [`CacheEvent`].

use crate::error::{ReportingError, ReportingResult};
use crate::observer::{CacheEvent, CacheObserver, RemovalReason};
use crate::policy::ReportingPolicy;
use crate::types::{
    BackoffState, Destination, EndpointClient, EndpointKey, EndpointRegistration, NewReport,
    Origin, Report, ReportId, ReportStatus,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Position of a report in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    created_at: DateTime<Utc>,
    seq: u64,
}

impl OrderKey {
    fn of(report: &Report) -> Self {
        Self {
            created_at: report.created_at,
            seq: report.seq,
        }
    }
}

type OrderIndex = BTreeMap<OrderKey, ReportId>;

/// Result of a bulk `mark_failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureSummary {
    /// Reports returned to Queued.
    pub requeued: usize,
    /// Reports that exhausted their attempts.
    pub discarded: usize,
}

/// Result of a maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionSummary {
    pub reports: usize,
    pub endpoints: usize,
}

/// Bounded store of reports and endpoint clients.
pub struct ReportingCache {
    policy: Arc<ReportingPolicy>,
    observer: Arc<dyn CacheObserver>,
    reports: HashMap<ReportId, Report>,
    next_seq: u64,
    evictable: OrderIndex,
    evictable_by_origin: HashMap<Origin, OrderIndex>,
    counts_by_origin: HashMap<Origin, usize>,
    queued: BTreeMap<Destination, OrderIndex>,
    endpoints: BTreeMap<EndpointKey, EndpointClient>,
    dirty: bool,
}

impl ReportingCache {
    pub fn new(policy: Arc<ReportingPolicy>, observer: Arc<dyn CacheObserver>) -> Self {
        Self {
            policy,
            observer,
            reports: HashMap::new(),
            next_seq: 0,
            evictable: BTreeMap::new(),
            evictable_by_origin: HashMap::new(),
            counts_by_origin: HashMap::new(),
            queued: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn policy(&self) -> &ReportingPolicy {
        &self.policy
    }

    // =========================================================================
    // Reports
    // =========================================================================

    /// Queues a new report created at `now`.
    ///
    /// At the origin cap the origin's oldest non-InFlight report is evicted;
    /// at the global cap the globally oldest non-InFlight report is evicted.
    /// InFlight reports are never evicted: when nothing can be evicted the
    /// new report is rejected with [`ReportingError::CapacityExceeded`].
    pub fn add_report(&mut self, new: NewReport, now: DateTime<Utc>) -> ReportingResult<ReportId> {
        let origin = new.origin().clone();

        if self.origin_report_count(&origin) >= self.policy.max_reports_per_origin {
            let victim = self
                .evictable_by_origin
                .get(&origin)
                .and_then(|index| index.values().next().copied());
            match victim {
                Some(id) => {
                    self.remove_report(id, RemovalReason::Capacity);
                }
                None => {
                    warn!(origin = %origin, "Origin report capacity exhausted by in-flight reports");
                    return Err(ReportingError::CapacityExceeded { origin });
                }
            }
        }

        if self.reports.len() >= self.policy.max_reports {
            match self.evictable.values().next().copied() {
                Some(id) => {
                    self.remove_report(id, RemovalReason::Capacity);
                }
                None => {
                    warn!(origin = %origin, "Global report capacity exhausted by in-flight reports");
                    return Err(ReportingError::CapacityExceeded { origin });
                }
            }
        }

        let mut report = new.into_report(now);
        report.seq = self.next_seq;
        self.next_seq += 1;

        let id = report.id;
        debug!(
            report_id = %id,
            origin = %report.origin,
            group = %report.group,
            report_type = %report.report_type,
            "Queued report"
        );
        self.insert_report(report);
        self.observer.on_cache_event(CacheEvent::ReportQueued { id });
        Ok(id)
    }

    /// Queued reports for (origin, group), oldest first.
    ///
    /// The iterator is lazy and can be cloned to restart it. InFlight reports
    /// never appear.
    pub fn reports_for_destination<'a>(
        &'a self,
        origin: &Origin,
        group: &str,
    ) -> impl Iterator<Item = &'a Report> + Clone + 'a {
        let destination = Destination::new(origin.clone(), group);
        self.queued
            .get(&destination)
            .into_iter()
            .flat_map(|index| index.values())
            .filter_map(move |id| self.reports.get(id))
    }

    /// Destinations with at least one Queued report, in a stable order.
    pub fn destinations_with_queued_reports(&self) -> Vec<Destination> {
        self.queued.keys().cloned().collect()
    }

    /// Moves Queued reports to InFlight and counts the attempt.
    ///
    /// Ids that are unknown or not Queued are skipped. Returns the number of
    /// reports transitioned.
    pub fn mark_in_flight(&mut self, ids: &[ReportId]) -> usize {
        let count = self.transition(ids, |report| {
            if report.status != ReportStatus::Queued {
                return Transition::Skip;
            }
            report.status = ReportStatus::InFlight;
            report.attempts += 1;
            Transition::Keep
        });
        self.emit_updated(count);
        count
    }

    /// Moves InFlight reports to Delivered.
    pub fn mark_delivered(&mut self, ids: &[ReportId]) -> usize {
        let count = self.transition(ids, |report| {
            if report.status != ReportStatus::InFlight {
                return Transition::Skip;
            }
            if report.doomed {
                return Transition::Remove;
            }
            report.status = ReportStatus::Delivered;
            Transition::Keep
        });
        self.emit_updated(count);
        count
    }

    /// Re-queues InFlight reports with attempts remaining; discards the rest.
    pub fn mark_failed(&mut self, ids: &[ReportId]) -> FailureSummary {
        let max_attempts = self.policy.max_attempts;
        let mut summary = FailureSummary::default();
        self.transition(ids, |report| {
            if report.status != ReportStatus::InFlight {
                return Transition::Skip;
            }
            if report.doomed {
                return Transition::Remove;
            }
            if report.attempts < max_attempts {
                report.status = ReportStatus::Queued;
                summary.requeued += 1;
            } else {
                report.status = ReportStatus::Discarded;
                summary.discarded += 1;
            }
            Transition::Keep
        });
        if summary.discarded > 0 {
            debug!(count = summary.discarded, "Reports exhausted their attempts");
        }
        self.emit_updated(summary.requeued + summary.discarded);
        summary
    }

    /// Discards Queued or InFlight reports without retry.
    pub fn mark_discarded(&mut self, ids: &[ReportId]) -> usize {
        let count = self.transition(ids, |report| match report.status {
            ReportStatus::Queued | ReportStatus::InFlight => {
                if report.doomed {
                    return Transition::Remove;
                }
                report.status = ReportStatus::Discarded;
                Transition::Keep
            }
            _ => Transition::Skip,
        });
        self.emit_updated(count);
        count
    }

    /// Maintenance pass.
    ///
    /// Removes non-InFlight reports older than the report age limit, every
    /// Delivered or Discarded report, and endpoints past their TTL or unused
    /// for longer than the staleness limit.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> EvictionSummary {
        let max_age = self.policy.max_report_age;
        let mut expired: Vec<(OrderKey, ReportId, RemovalReason)> = self
            .reports
            .values()
            .filter_map(|report| {
                let reason = match report.status {
                    ReportStatus::InFlight => return None,
                    ReportStatus::Delivered => RemovalReason::Delivered,
                    ReportStatus::Discarded => RemovalReason::Discarded,
                    ReportStatus::Queued if report.age(now) > max_age => RemovalReason::Expired,
                    ReportStatus::Queued => return None,
                };
                Some((OrderKey::of(report), report.id, reason))
            })
            .collect();
        expired.sort_by_key(|(key, _, _)| *key);

        for (_, id, reason) in &expired {
            self.remove_report(*id, *reason);
        }

        let staleness = chrono::Duration::from_std(self.policy.max_endpoint_group_staleness)
            .unwrap_or(chrono::Duration::MAX);
        let stale: Vec<EndpointKey> = self
            .endpoints
            .values()
            .filter(|client| {
                client.is_expired(now)
                    || now.signed_duration_since(client.last_used) > staleness
            })
            .map(|client| client.key.clone())
            .collect();

        for key in &stale {
            self.remove_endpoint(key, RemovalReason::Expired);
        }

        EvictionSummary {
            reports: expired.len(),
            endpoints: stale.len(),
        }
    }

    /// Removes reports matching `filter`.
    ///
    /// InFlight matches are doomed instead: they are removed when their upload
    /// completes. Returns the number of reports removed or doomed.
    pub fn remove_reports<F>(&mut self, filter: F) -> usize
    where
        F: Fn(&Report) -> bool,
    {
        let mut matched: Vec<(OrderKey, ReportId, bool)> = self
            .reports
            .values()
            .filter(|report| !report.doomed && filter(*report))
            .map(|report| {
                (
                    OrderKey::of(report),
                    report.id,
                    report.status == ReportStatus::InFlight,
                )
            })
            .collect();
        matched.sort();

        for (_, id, in_flight) in &matched {
            if *in_flight {
                if let Some(report) = self.reports.get_mut(id) {
                    report.doomed = true;
                    self.dirty = true;
                }
            } else {
                self.remove_report(*id, RemovalReason::Cleared);
            }
        }
        matched.len()
    }

    pub fn remove_all_reports(&mut self) -> usize {
        self.remove_reports(|_| true)
    }

    pub fn report(&self, id: &ReportId) -> Option<&Report> {
        self.reports.get(id)
    }

    /// All reports in creation order.
    pub fn reports(&self) -> Vec<&Report> {
        let mut reports: Vec<&Report> = self.reports.values().collect();
        reports.sort_by_key(|report| OrderKey::of(report));
        reports
    }

    pub fn report_count(&self) -> usize {
        self.reports.len()
    }

    pub fn origin_report_count(&self, origin: &Origin) -> usize {
        self.counts_by_origin.get(origin).copied().unwrap_or(0)
    }

    pub fn count_with_status(&self, status: ReportStatus) -> usize {
        self.reports
            .values()
            .filter(|report| report.status == status)
            .count()
    }

    /// Inserts a report rebuilt from persisted state.
    ///
    /// Restored reports do not evict: when a cap is reached, or the id is
    /// already present, the report is dropped and `false` is returned.
    pub(crate) fn restore_report(&mut self, mut report: Report) -> bool {
        if self.reports.contains_key(&report.id)
            || self.origin_report_count(&report.origin) >= self.policy.max_reports_per_origin
            || self.reports.len() >= self.policy.max_reports
        {
            return false;
        }
        report.seq = self.next_seq;
        self.next_seq += 1;
        self.insert_report(report);
        true
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Registers an endpoint or refreshes an existing registration.
    ///
    /// Refreshing keeps the endpoint's backoff state. A new endpoint at the
    /// origin or global cap evicts the least recently used endpoint (origin
    /// first, then global).
    pub fn upsert_endpoint(
        &mut self,
        registration: EndpointRegistration,
        now: DateTime<Utc>,
    ) -> ReportingResult<()> {
        let key = registration.key();

        if let Some(existing) = self.endpoints.get_mut(&key) {
            let backoff = std::mem::take(&mut existing.backoff);
            let mut client = registration.into_client(now);
            client.backoff = backoff;
            *existing = client;
        } else {
            if self.origin_endpoint_count(&key.origin) >= self.policy.max_endpoints_per_origin {
                let victim = self
                    .endpoints
                    .values()
                    .filter(|client| client.origin() == &key.origin)
                    .min_by_key(|client| client.last_used)
                    .map(|client| client.key.clone());
                let Some(victim) = victim else {
                    return Err(ReportingError::CapacityExceeded {
                        origin: key.origin.clone(),
                    });
                };
                self.remove_endpoint(&victim, RemovalReason::Capacity);
            }

            if self.endpoints.len() >= self.policy.max_endpoints {
                let victim = self
                    .endpoints
                    .values()
                    .min_by_key(|client| client.last_used)
                    .map(|client| client.key.clone());
                let Some(victim) = victim else {
                    return Err(ReportingError::CapacityExceeded {
                        origin: key.origin.clone(),
                    });
                };
                self.remove_endpoint(&victim, RemovalReason::Capacity);
            }

            self.endpoints
                .insert(key.clone(), registration.into_client(now));
        }

        debug!(endpoint = %key, "Registered endpoint");
        self.dirty = true;
        self.observer
            .on_cache_event(CacheEvent::EndpointUpserted { key });
        Ok(())
    }

    /// Endpoints serving (origin, group).
    ///
    /// Falls back to the nearest superdomain registration that includes
    /// subdomains when the origin has none of its own.
    pub fn endpoints_for_origin_group(&self, origin: &Origin, group: &str) -> Vec<&EndpointClient> {
        let exact: Vec<&EndpointClient> = self
            .endpoints
            .values()
            .filter(|client| client.origin() == origin && client.group() == group)
            .collect();
        if !exact.is_empty() {
            return exact;
        }

        for superdomain in origin.superdomains() {
            let inherited: Vec<&EndpointClient> = self
                .endpoints
                .values()
                .filter(|client| {
                    client.include_subdomains
                        && client.origin() == &superdomain
                        && client.group() == group
                })
                .collect();
            if !inherited.is_empty() {
                return inherited;
            }
        }
        Vec::new()
    }

    pub fn endpoint(&self, key: &EndpointKey) -> Option<&EndpointClient> {
        self.endpoints.get(key)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointClient> {
        self.endpoints.values()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn origin_endpoint_count(&self, origin: &Origin) -> usize {
        self.endpoints
            .keys()
            .filter(|key| &key.origin == origin)
            .count()
    }

    /// Records that the endpoint was selected for delivery.
    pub fn touch_endpoint(&mut self, key: &EndpointKey, now: DateTime<Utc>) {
        if let Some(client) = self.endpoints.get_mut(key) {
            client.last_used = now;
            self.dirty = true;
        }
    }

    /// Applies `update` to the endpoint's backoff state.
    pub(crate) fn update_backoff<F>(&mut self, key: &EndpointKey, update: F) -> Option<BackoffState>
    where
        F: FnOnce(&mut BackoffState),
    {
        let client = self.endpoints.get_mut(key)?;
        update(&mut client.backoff);
        self.dirty = true;
        Some(client.backoff.clone())
    }

    pub fn remove_endpoint(&mut self, key: &EndpointKey, reason: RemovalReason) -> bool {
        if self.endpoints.remove(key).is_none() {
            return false;
        }
        debug!(endpoint = %key, reason = ?reason, "Removed endpoint");
        self.dirty = true;
        self.observer.on_cache_event(CacheEvent::EndpointRemoved {
            key: key.clone(),
            reason,
        });
        true
    }

    /// Removes every endpoint whose key matches `predicate`.
    pub fn remove_endpoints_where<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&EndpointKey) -> bool,
    {
        let keys: Vec<EndpointKey> = self
            .endpoints
            .keys()
            .filter(|key| predicate(*key))
            .cloned()
            .collect();
        for key in &keys {
            self.remove_endpoint(key, RemovalReason::Cleared);
        }
        keys.len()
    }

    pub fn remove_endpoints_for_origin(&mut self, origin: &Origin) -> usize {
        self.remove_endpoints_where(|key| &key.origin == origin)
    }

    pub fn remove_endpoints_for_origin_group(&mut self, origin: &Origin, group: &str) -> usize {
        self.remove_endpoints_where(|key| &key.origin == origin && key.group == group)
    }

    /// Removes every registration of `url`, across origins and groups.
    pub fn remove_endpoints_with_url(&mut self, url: &Url) -> usize {
        self.remove_endpoints_where(|key| &key.url == url)
    }

    pub fn remove_all_endpoints(&mut self) -> usize {
        self.remove_endpoints_where(|_| true)
    }

    /// Inserts an endpoint rebuilt from persisted state, unless a cap is reached.
    pub(crate) fn restore_endpoint(&mut self, client: EndpointClient) -> bool {
        if self.endpoints.len() >= self.policy.max_endpoints
            || self.origin_endpoint_count(client.origin()) >= self.policy.max_endpoints_per_origin
        {
            return false;
        }
        self.endpoints.insert(client.key.clone(), client);
        true
    }

    // =========================================================================
    // Persistence bookkeeping
    // =========================================================================

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns the dirty flag and clears it.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn insert_report(&mut self, report: Report) {
        *self
            .counts_by_origin
            .entry(report.origin.clone())
            .or_insert(0) += 1;
        self.index(&report);
        self.reports.insert(report.id, report);
        self.dirty = true;
    }

    fn remove_report(&mut self, id: ReportId, reason: RemovalReason) -> Option<Report> {
        let report = self.reports.remove(&id)?;
        self.unindex(&report);
        if let Some(count) = self.counts_by_origin.get_mut(&report.origin) {
            *count -= 1;
            if *count == 0 {
                self.counts_by_origin.remove(&report.origin);
            }
        }
        debug!(report_id = %id, origin = %report.origin, reason = ?reason, "Removed report");
        self.dirty = true;
        self.observer
            .on_cache_event(CacheEvent::ReportRemoved { id, reason });
        Some(report)
    }

    /// Applies `step` to each report, keeping the indices in sync.
    fn transition<F>(&mut self, ids: &[ReportId], mut step: F) -> usize
    where
        F: FnMut(&mut Report) -> Transition,
    {
        let mut count = 0;
        for id in ids {
            let Some(mut report) = self.reports.remove(id) else {
                continue;
            };
            self.unindex(&report);
            match step(&mut report) {
                Transition::Skip => {
                    self.index(&report);
                    self.reports.insert(*id, report);
                }
                Transition::Keep => {
                    count += 1;
                    self.index(&report);
                    self.reports.insert(*id, report);
                }
                Transition::Remove => {
                    count += 1;
                    self.index(&report);
                    self.reports.insert(*id, report);
                    self.remove_report(*id, RemovalReason::Cleared);
                }
            }
        }
        if count > 0 {
            self.dirty = true;
        }
        count
    }

    fn emit_updated(&self, count: usize) {
        if count > 0 {
            self.observer
                .on_cache_event(CacheEvent::ReportsUpdated { count });
        }
    }

    fn index(&mut self, report: &Report) {
        let key = OrderKey::of(report);
        if report.status != ReportStatus::InFlight {
            self.evictable.insert(key, report.id);
            self.evictable_by_origin
                .entry(report.origin.clone())
                .or_default()
                .insert(key, report.id);
        }
        if report.status == ReportStatus::Queued {
            self.queued
                .entry(report.destination())
                .or_default()
                .insert(key, report.id);
        }
    }

    fn unindex(&mut self, report: &Report) {
        let key = OrderKey::of(report);
        self.evictable.remove(&key);
        if let Some(index) = self.evictable_by_origin.get_mut(&report.origin) {
            index.remove(&key);
            if index.is_empty() {
                self.evictable_by_origin.remove(&report.origin);
            }
        }
        let destination = report.destination();
        if let Some(index) = self.queued.get_mut(&destination) {
            index.remove(&key);
            if index.is_empty() {
                self.queued.remove(&destination);
            }
        }
    }
}

/// Outcome of a single status step inside [`ReportingCache::transition`].
enum Transition {
    Skip,
    Keep,
    Remove,
}

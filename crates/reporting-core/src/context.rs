//! Composition root.
//!
//! [`ReportingContext`] wires the policy, clock, delegate and uploader into
//! the cache, endpoint manager and delivery agent, and exposes the service
//! surface upstream code talks to.

use crate::cache::{EvictionSummary, ReportingCache};
use crate::clock::{Clock, SystemClock};
use crate::delegate::ReportingDelegate;
use crate::delivery_agent::{DeliveryAgent, ReportingState, RoundSummary, SharedState};
use crate::endpoint_manager::EndpointManager;
use crate::error::ReportingResult;
use crate::header::parse_report_to;
use crate::observer::{CacheObserver, NullObserver, RemovalReason};
use crate::persistence::PersistedState;
use crate::policy::ReportingPolicy;
use crate::types::{EndpointKey, EndpointRegistration, NewReport, Origin, ReportId};
use crate::uploader::ReportingUploader;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

/// Host-provided behaviors, chosen at construction time.
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub delegate: Arc<dyn ReportingDelegate>,
    pub uploader: Arc<dyn ReportingUploader>,
    pub observer: Arc<dyn CacheObserver>,
    /// Seed for endpoint tie-breaks.
    pub rng_seed: u64,
}

impl Collaborators {
    /// System clock, no observer and a random seed.
    pub fn new(uploader: Arc<dyn ReportingUploader>, delegate: Arc<dyn ReportingDelegate>) -> Self {
        Self {
            clock: Arc::new(SystemClock::new()),
            delegate,
            uploader,
            observer: Arc::new(NullObserver),
            rng_seed: rand::random(),
        }
    }
}

/// Which kinds of data `remove_browsing_data` clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTypes {
    pub reports: bool,
    pub endpoints: bool,
}

impl DataTypes {
    pub const REPORTS: DataTypes = DataTypes {
        reports: true,
        endpoints: false,
    };
    pub const ENDPOINTS: DataTypes = DataTypes {
        reports: false,
        endpoints: true,
    };
    pub const ALL: DataTypes = DataTypes {
        reports: true,
        endpoints: true,
    };
}

/// Counts of data removed by a clearing operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalSummary {
    /// Reports removed, or doomed if in flight.
    pub reports: usize,
    pub endpoints: usize,
}

/// The reporting service.
pub struct ReportingContext {
    policy: Arc<ReportingPolicy>,
    clock: Arc<dyn Clock>,
    delegate: Arc<dyn ReportingDelegate>,
    state: SharedState,
    agent: Arc<DeliveryAgent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
}

impl ReportingContext {
    /// Builds the context and restores persisted state.
    ///
    /// A delegate load failure or an undecodable blob is logged and the
    /// cache starts empty.
    pub fn new(policy: ReportingPolicy, collaborators: Collaborators) -> Self {
        let Collaborators {
            clock,
            delegate,
            uploader,
            observer,
            rng_seed,
        } = collaborators;
        let policy = Arc::new(policy);

        let mut cache = ReportingCache::new(policy.clone(), observer);
        load_persisted_state(&policy, clock.as_ref(), delegate.as_ref(), &mut cache);

        let state = Arc::new(Mutex::new(ReportingState {
            cache,
            endpoints: EndpointManager::new(policy.clone(), clock.clone(), rng_seed),
        }));
        let agent = Arc::new(DeliveryAgent::new(
            policy.clone(),
            clock.clone(),
            state.clone(),
            uploader,
        ));
        let (stop_tx, _) = watch::channel(false);

        Self {
            policy,
            clock,
            delegate,
            state,
            agent,
            tasks: Mutex::new(Vec::new()),
            stop_tx,
        }
    }

    pub fn policy(&self) -> &ReportingPolicy {
        &self.policy
    }

    // =========================================================================
    // Upstream entry points
    // =========================================================================

    /// Queues a report generated by the document at `url`.
    pub fn queue_report(
        &self,
        url: &Url,
        group: &str,
        report_type: &str,
        body: serde_json::Value,
    ) -> ReportingResult<ReportId> {
        let report = NewReport::new(url, group, report_type, body)?;
        let now = self.clock.now();
        self.state.lock().cache.add_report(report, now)
    }

    pub fn register_endpoint(&self, registration: EndpointRegistration) -> ReportingResult<()> {
        let now = self.clock.now();
        self.state.lock().cache.upsert_endpoint(registration, now)
    }

    pub fn unregister_endpoint(&self, key: &EndpointKey) -> bool {
        self.state
            .lock()
            .cache
            .remove_endpoint(key, RemovalReason::Cleared)
    }

    /// Applies a `Report-To` header received on `document_url`.
    ///
    /// Each declared group replaces the origin's previous endpoints for that
    /// group; a zero `max_age` removes the group. Returns the number of
    /// groups applied.
    pub fn process_header(&self, document_url: &Url, value: &str) -> ReportingResult<usize> {
        let groups = parse_report_to(document_url, value)?;
        let origin = Origin::from_url(document_url)?;
        let now = self.clock.now();

        let mut guard = self.state.lock();
        let cache = &mut guard.cache;
        let mut applied = 0;

        for group in groups {
            if group.is_removal() {
                let removed = cache.remove_endpoints_for_origin_group(&origin, &group.group);
                debug!(origin = %origin, group = %group.group, removed, "Header removed endpoint group");
                applied += 1;
                continue;
            }

            let declared: HashSet<&Url> = group.endpoints.iter().map(|e| &e.url).collect();
            cache.remove_endpoints_where(|key| {
                key.origin == origin && key.group == group.group && !declared.contains(&key.url)
            });

            for registration in group.registrations(&origin) {
                if let Err(e) = cache.upsert_endpoint(registration, now) {
                    warn!(origin = %origin, group = %group.group, error = %e, "Failed to register endpoint from header");
                }
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Removes reports and/or endpoints whose origin matches `origin_filter`.
    ///
    /// In-flight reports are removed when their upload completes.
    pub fn remove_browsing_data<F>(&self, data_types: DataTypes, origin_filter: F) -> RemovalSummary
    where
        F: Fn(&Origin) -> bool,
    {
        let mut guard = self.state.lock();
        let mut summary = RemovalSummary::default();
        if data_types.reports {
            summary.reports = guard
                .cache
                .remove_reports(|report| origin_filter(&report.origin));
        }
        if data_types.endpoints {
            summary.endpoints = guard
                .cache
                .remove_endpoints_where(|key| origin_filter(&key.origin));
        }
        info!(
            reports = summary.reports,
            endpoints = summary.endpoints,
            "Removed browsing data"
        );
        summary
    }

    /// Clears state according to the network-change policy.
    pub fn on_network_changed(&self) -> RemovalSummary {
        let mut guard = self.state.lock();
        let mut summary = RemovalSummary::default();
        if self.policy.clear_reports_on_network_change {
            summary.reports = guard.cache.remove_all_reports();
        }
        if self.policy.clear_endpoints_on_network_change {
            summary.endpoints = guard.cache.remove_all_endpoints();
        }
        info!(
            reports = summary.reports,
            endpoints = summary.endpoints,
            "Network changed"
        );
        summary
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Runs a delivery round on the calling task's runtime.
    pub fn deliver_now(&self) -> RoundSummary {
        self.agent.deliver_round()
    }

    /// Asks the background delivery loop for a round.
    pub fn request_delivery(&self) {
        self.agent.request_delivery();
    }

    pub fn collect_garbage(&self) -> EvictionSummary {
        let now = self.clock.now();
        let summary = self.state.lock().cache.evict_expired(now);
        if summary != EvictionSummary::default() {
            debug!(
                reports = summary.reports,
                endpoints = summary.endpoints,
                "Garbage collected"
            );
        }
        summary
    }

    /// Writes the cache to the delegate if it changed since the last write.
    ///
    /// Returns whether anything was written. On failure the cache stays
    /// dirty so the next attempt retries.
    pub fn persist_now(&self) -> ReportingResult<bool> {
        let blob = {
            let mut guard = self.state.lock();
            if !guard.cache.take_dirty() {
                return Ok(false);
            }
            let state = PersistedState::snapshot(&guard.cache, self.clock.now(), self.clock.ticks());
            match state.to_bytes() {
                Ok(blob) => blob,
                Err(e) => {
                    guard.cache.mark_dirty();
                    return Err(e);
                }
            }
        };

        let size = blob.len();
        if let Err(e) = self.delegate.persist_state(blob) {
            warn!(error = %e, "Failed to persist reporting state");
            self.state.lock().cache.mark_dirty();
            return Err(e);
        }
        debug!(bytes = size, "Persisted reporting state");
        Ok(true)
    }

    /// Starts the delivery, garbage collection and persistence loops.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Reporting context already started");
            return;
        }

        if let Some(handle) = self.agent.start() {
            tasks.push(handle);
        }
        tasks.push(self.spawn_periodic(
            self.policy.garbage_collection_interval,
            |context| {
                context.collect_garbage();
            },
        ));
        tasks.push(self.spawn_periodic(self.policy.persistence_interval, |context| {
            // Failures are logged by persist_now and retried next tick.
            let _ = context.persist_now();
        }));
        info!("Reporting context started");
    }

    fn spawn_periodic(
        self: &Arc<Self>,
        period: Duration,
        work: fn(&ReportingContext),
    ) -> JoinHandle<()> {
        let context = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => work(&context),
                    _ = stop_rx.changed() => break,
                }
            }
        })
    }

    /// Waits for every outstanding upload to apply its outcome.
    pub async fn wait_for_uploads(&self) {
        self.agent.wait_for_uploads().await;
    }

    /// Uploads currently outstanding.
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().endpoints.pending_count()
    }

    /// Stops the loops, waits up to `grace` for uploads, and persists.
    ///
    /// Returns the number of uploads abandoned.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let _ = self.stop_tx.send(true);
        let abandoned = self.agent.shutdown(grace).await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        if self.persist_now().is_err() {
            warn!("Final persist failed; unsaved reporting state is lost");
        }
        info!(abandoned, "Reporting context shut down");
        abandoned
    }

    /// Runs `f` with read access to the cache.
    pub fn with_cache<R>(&self, f: impl FnOnce(&ReportingCache) -> R) -> R {
        f(&self.state.lock().cache)
    }
}

fn load_persisted_state(
    policy: &ReportingPolicy,
    clock: &dyn Clock,
    delegate: &dyn ReportingDelegate,
    cache: &mut ReportingCache,
) {
    let bytes = match delegate.load_persisted_state() {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "Failed to load persisted reporting state; starting empty");
            return;
        }
    };

    match PersistedState::from_bytes(&bytes) {
        Ok(state) => {
            let summary = state.restore_into(
                cache,
                clock.now(),
                clock.ticks(),
                policy.persist_reports_across_restarts,
                policy.persist_endpoints_across_restarts,
            );
            info!(
                reports = summary.reports,
                endpoints = summary.endpoints,
                "Loaded persisted reporting state"
            );
        }
        Err(e) => {
            warn!(error = %e, "Discarding unreadable persisted reporting state");
        }
    }
}

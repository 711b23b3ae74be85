//! Delivery scheduling.
//!
//! A delivery round runs entirely under the state lock:
//!
//! 1. maintenance: `evict_expired(now)`
//! 2. collect: resolve each destination with Queued reports to an endpoint
//! 3. batch: gather Queued reports oldest first, mark them InFlight and
//!    mark the endpoint URL pending
//! 4. spawn one upload task per endpoint URL
//!
//! Upload tasks are the only work that runs outside the lock. Each one
//! re-enters it to apply the outcome to the cache and the endpoint manager.

use crate::cache::ReportingCache;
use crate::clock::Clock;
use crate::endpoint_manager::EndpointManager;
use crate::policy::ReportingPolicy;
use crate::types::{EndpointKey, ReportId};
use crate::uploader::{serialize_reports, ReportingUploader, UploadOutcome};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

/// State guarded by the single reporting lock.
pub struct ReportingState {
    pub cache: ReportingCache,
    pub endpoints: EndpointManager,
}

pub type SharedState = Arc<Mutex<ReportingState>>;

/// What a delivery round did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Destinations with at least one Queued report.
    pub destinations: usize,
    /// Destinations with no eligible endpoint.
    pub skipped_no_endpoint: usize,
    /// Destinations left Queued by the fan-out or batch size limit.
    pub deferred: usize,
    pub uploads_started: usize,
    /// Reports moved to InFlight this round.
    pub reports_in_flight: usize,
    pub reports_evicted: usize,
    pub endpoints_evicted: usize,
}

/// An upload being assembled during a round.
#[derive(Debug)]
struct UploadBatch {
    url: Url,
    /// Endpoint clients whose reports share this upload.
    endpoints: Vec<EndpointKey>,
    reports: Vec<ReportId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentSignal {
    DeliverNow,
    Stop,
}

/// Turns queued reports into uploads.
pub struct DeliveryAgent {
    policy: Arc<ReportingPolicy>,
    clock: Arc<dyn Clock>,
    state: SharedState,
    uploader: Arc<dyn ReportingUploader>,
    uploads: Mutex<JoinSet<()>>,
    signal_tx: mpsc::UnboundedSender<AgentSignal>,
    /// Taken by the background loop on start.
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<AgentSignal>>>,
}

impl DeliveryAgent {
    pub fn new(
        policy: Arc<ReportingPolicy>,
        clock: Arc<dyn Clock>,
        state: SharedState,
        uploader: Arc<dyn ReportingUploader>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            policy,
            clock,
            state,
            uploader,
            uploads: Mutex::new(JoinSet::new()),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        }
    }

    /// Runs one delivery round.
    ///
    /// Never blocks on the network: uploads are spawned onto the current
    /// tokio runtime and complete in the background.
    pub fn deliver_round(&self) -> RoundSummary {
        let now = self.clock.now();
        let mut summary = RoundSummary::default();
        let mut spawned: Vec<(UploadBatch, String)> = Vec::new();

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let evicted = state.cache.evict_expired(now);
            summary.reports_evicted = evicted.reports;
            summary.endpoints_evicted = evicted.endpoints;

            let batches = self.collect_batches(state, &mut summary);

            for batch in batches {
                let payload = match serialize_reports(
                    batch.reports.iter().filter_map(|id| state.cache.report(id)),
                    now,
                ) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(url = %batch.url, error = %e, "Failed to encode upload; leaving reports queued");
                        continue;
                    }
                };

                summary.reports_in_flight += state.cache.mark_in_flight(&batch.reports);
                for key in &batch.endpoints {
                    state.cache.touch_endpoint(key, now);
                }
                state.endpoints.set_pending(&batch.url);
                spawned.push((batch, payload));
            }
        }

        summary.uploads_started = spawned.len();
        if !spawned.is_empty() {
            let mut uploads = self.uploads.lock();
            while uploads.try_join_next().is_some() {}

            for (batch, payload) in spawned {
                debug!(
                    url = %batch.url,
                    reports = batch.reports.len(),
                    endpoints = batch.endpoints.len(),
                    "Starting upload"
                );
                let uploader = Arc::clone(&self.uploader);
                let state = Arc::clone(&self.state);
                uploads.spawn(async move {
                    let outcome = uploader.upload(&batch.url, payload).await;
                    complete_upload(&state, batch, outcome);
                });
            }
        }

        if summary != RoundSummary::default() {
            debug!(
                destinations = summary.destinations,
                skipped = summary.skipped_no_endpoint,
                deferred = summary.deferred,
                uploads = summary.uploads_started,
                reports = summary.reports_in_flight,
                evicted = summary.reports_evicted,
                "Delivery round finished"
            );
        }
        summary
    }

    /// Collect and batch, grouping destinations that resolve to the same
    /// endpoint URL into one upload.
    fn collect_batches(
        &self,
        state: &mut ReportingState,
        summary: &mut RoundSummary,
    ) -> Vec<UploadBatch> {
        let max_per_upload = self.policy.max_reports_per_upload;
        let max_uploads = self.policy.max_concurrent_uploads;

        let mut batches: Vec<UploadBatch> = Vec::new();
        let mut by_url: HashMap<Url, usize> = HashMap::new();

        for destination in state.cache.destinations_with_queued_reports() {
            summary.destinations += 1;

            let Some(key) = state.endpoints.find_endpoint_for_delivery(
                &state.cache,
                &destination.origin,
                &destination.group,
            ) else {
                summary.skipped_no_endpoint += 1;
                continue;
            };

            let index = match by_url.get(&key.url) {
                Some(index) => *index,
                None => {
                    if state.endpoints.pending_count() + batches.len() >= max_uploads {
                        summary.deferred += 1;
                        continue;
                    }
                    by_url.insert(key.url.clone(), batches.len());
                    batches.push(UploadBatch {
                        url: key.url.clone(),
                        endpoints: Vec::new(),
                        reports: Vec::new(),
                    });
                    batches.len() - 1
                }
            };

            let batch = &mut batches[index];
            let room = max_per_upload.saturating_sub(batch.reports.len());
            let before = batch.reports.len();
            batch.reports.extend(
                state
                    .cache
                    .reports_for_destination(&destination.origin, &destination.group)
                    .take(room)
                    .map(|report| report.id),
            );
            if batch.reports.len() > before {
                batch.endpoints.push(key);
            } else {
                summary.deferred += 1;
            }
        }

        batches.retain(|batch| !batch.reports.is_empty());
        batches
    }

    /// Starts the background loop: a round every delivery interval and on
    /// every [`request_delivery`](Self::request_delivery), until
    /// [`stop`](Self::stop).
    ///
    /// Returns `None` if the loop was already started.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let Some(mut receiver) = self.signal_rx.lock().take() else {
            warn!("Delivery agent already started");
            return None;
        };

        let agent = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = interval(agent.policy.delivery_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(
                interval_ms = agent.policy.delivery_interval.as_millis() as u64,
                "Delivery loop started"
            );
            loop {
                tokio::select! {
                    signal = receiver.recv() => {
                        match signal {
                            Some(AgentSignal::DeliverNow) => {
                                agent.deliver_round();
                            }
                            Some(AgentSignal::Stop) | None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        agent.deliver_round();
                    }
                }
            }
            info!("Delivery loop stopped");
        }))
    }

    /// Asks the background loop for an immediate round.
    pub fn request_delivery(&self) {
        let _ = self.signal_tx.send(AgentSignal::DeliverNow);
    }

    /// Stops the background loop. Outstanding uploads keep running.
    pub fn stop(&self) {
        let _ = self.signal_tx.send(AgentSignal::Stop);
    }

    /// Number of upload tasks not yet reaped, finished or not.
    pub fn upload_tasks(&self) -> usize {
        self.uploads.lock().len()
    }

    /// Waits until every outstanding upload has applied its outcome,
    /// including uploads started while waiting.
    pub async fn wait_for_uploads(&self) {
        loop {
            let mut uploads = std::mem::take(&mut *self.uploads.lock());
            if uploads.is_empty() {
                return;
            }
            while let Some(result) = uploads.join_next().await {
                log_join_result(result);
            }
        }
    }

    /// Stops the loop and waits up to `grace` for outstanding uploads.
    ///
    /// Uploads still running at the deadline are aborted. Their reports stay
    /// InFlight in memory; persisted state records them as Queued so they
    /// are retried after restart. Returns the number of uploads abandoned.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.stop();
        let deadline = Instant::now() + grace;

        loop {
            let mut uploads = std::mem::take(&mut *self.uploads.lock());
            if uploads.is_empty() {
                return 0;
            }

            loop {
                let next = tokio::time::timeout_at(deadline, uploads.join_next()).await;
                match next {
                    Ok(Some(result)) => log_join_result(result),
                    Ok(None) => break,
                    Err(_) => {
                        let mut abandoned = uploads.len();
                        uploads.shutdown().await;
                        let mut late = std::mem::take(&mut *self.uploads.lock());
                        abandoned += late.len();
                        late.shutdown().await;
                        warn!(abandoned, "Abandoned uploads at shutdown");
                        return abandoned;
                    }
                }
            }
        }
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Upload task panicked");
        }
    }
}

/// Applies an upload outcome under the state lock.
fn complete_upload(state: &Mutex<ReportingState>, batch: UploadBatch, outcome: UploadOutcome) {
    let mut guard = state.lock();
    let state = &mut *guard;
    state.endpoints.clear_pending(&batch.url);

    match outcome {
        UploadOutcome::Success => {
            let delivered = state.cache.mark_delivered(&batch.reports);
            for key in &batch.endpoints {
                state
                    .endpoints
                    .inform_of_successful_delivery(&mut state.cache, key);
            }
            info!(url = %batch.url, reports = delivered, "Delivered reports");
        }
        UploadOutcome::RetryableFailure => {
            let summary = state.cache.mark_failed(&batch.reports);
            for key in &batch.endpoints {
                state
                    .endpoints
                    .inform_of_failed_delivery(&mut state.cache, key);
            }
            warn!(
                url = %batch.url,
                requeued = summary.requeued,
                discarded = summary.discarded,
                "Upload failed; will retry"
            );
        }
        UploadOutcome::PermanentFailure => {
            let discarded = state.cache.mark_discarded(&batch.reports);
            for key in &batch.endpoints {
                state
                    .endpoints
                    .inform_of_failed_delivery(&mut state.cache, key);
            }
            warn!(url = %batch.url, discarded, "Upload rejected; reports discarded");
        }
    }
}

//! Endpoint selection and per-endpoint backoff.
//!
//! The manager never stores endpoints itself: it reads candidates from the
//! [`ReportingCache`] and writes delivery outcomes back into each endpoint's
//! [`BackoffState`](crate::types::BackoffState). Its own state is the set of
//! endpoint URLs with an outstanding upload and the seeded tie-break source.

use crate::cache::ReportingCache;
use crate::clock::Clock;
use crate::observer::RemovalReason;
use crate::policy::ReportingPolicy;
use crate::types::{BackoffState, EndpointClient, EndpointKey, Origin};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Backoff delay after the `failures`-th consecutive failure:
/// `min(backoff_base * 2^(failures - 1), backoff_cap)`, zero for no failures.
pub fn backoff_delay(policy: &ReportingPolicy, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }

    let base_ms = policy.backoff_base.as_millis() as u64;
    let cap_ms = policy.backoff_cap.as_millis() as u64;
    let multiplier = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(multiplier).min(cap_ms);

    Duration::from_millis(delay_ms)
}

/// Selects delivery endpoints and tracks their health.
pub struct EndpointManager {
    policy: Arc<ReportingPolicy>,
    clock: Arc<dyn Clock>,
    /// Endpoint URLs with an upload outstanding.
    pending: HashSet<Url>,
    rng: StdRng,
}

impl EndpointManager {
    /// Creates a manager whose tie-breaks are drawn from a generator seeded
    /// with `seed`.
    pub fn new(policy: Arc<ReportingPolicy>, clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self {
            policy,
            clock,
            pending: HashSet::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Picks the endpoint to deliver (origin, group) reports to.
    ///
    /// Candidates in backoff, disabled, expired or with an upload outstanding
    /// are skipped. The survivors are ranked by lowest priority value, then
    /// highest weight; remaining ties are broken uniformly at random.
    /// Returns `None` when nothing is eligible, which is not an error.
    pub fn find_endpoint_for_delivery(
        &mut self,
        cache: &ReportingCache,
        origin: &Origin,
        group: &str,
    ) -> Option<EndpointKey> {
        let now = self.clock.now();
        let ticks = self.clock.ticks();

        let eligible: Vec<&EndpointClient> = cache
            .endpoints_for_origin_group(origin, group)
            .into_iter()
            .filter(|client| {
                client.backoff.is_eligible(ticks)
                    && !client.is_expired(now)
                    && !self.pending.contains(client.url())
            })
            .collect();

        let best_priority = eligible.iter().map(|client| client.priority).min()?;
        let best_weight = eligible
            .iter()
            .filter(|client| client.priority == best_priority)
            .map(|client| client.weight)
            .max()?;
        let finalists: Vec<&EndpointClient> = eligible
            .into_iter()
            .filter(|client| client.priority == best_priority && client.weight == best_weight)
            .collect();

        let chosen = match finalists.len() {
            0 => return None,
            1 => finalists[0],
            n => finalists[self.rng.gen_range(0..n)],
        };
        Some(chosen.key.clone())
    }

    /// Clears the endpoint's failure count and backoff.
    pub fn inform_of_successful_delivery(&self, cache: &mut ReportingCache, key: &EndpointKey) {
        let updated = cache.update_backoff(key, |state| {
            state.consecutive_failures = 0;
            state.next_eligible = None;
        });
        if updated.is_some() {
            debug!(endpoint = %key, "Endpoint backoff cleared");
        }
    }

    /// Counts a failure and schedules the endpoint's next eligible time.
    ///
    /// Once the failure count exceeds the policy maximum the endpoint is
    /// disabled and removed from the cache; upstream must register it again.
    /// Returns the updated state, or `None` if the endpoint is unknown.
    pub fn inform_of_failed_delivery(
        &self,
        cache: &mut ReportingCache,
        key: &EndpointKey,
    ) -> Option<BackoffState> {
        let ticks = self.clock.ticks();
        let policy = &self.policy;

        let state = cache.update_backoff(key, |state| {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            let delay = backoff_delay(policy, state.consecutive_failures);
            state.next_eligible = Some(ticks + delay);
            if state.consecutive_failures > policy.max_consecutive_failures {
                state.permanently_disabled = true;
            }
        })?;

        if state.permanently_disabled {
            warn!(
                endpoint = %key,
                failures = state.consecutive_failures,
                "Endpoint disabled after repeated failures"
            );
            cache.remove_endpoint(key, RemovalReason::Disabled);
        } else {
            debug!(
                endpoint = %key,
                failures = state.consecutive_failures,
                backoff_ms = backoff_delay(policy, state.consecutive_failures).as_millis() as u64,
                "Endpoint backing off"
            );
        }
        Some(state)
    }

    /// Marks `url` as having an upload outstanding. Returns `false` if it
    /// already had one.
    pub fn set_pending(&mut self, url: &Url) -> bool {
        self.pending.insert(url.clone())
    }

    pub fn clear_pending(&mut self, url: &Url) {
        self.pending.remove(url);
    }

    pub fn is_pending(&self, url: &Url) -> bool {
        self.pending.contains(url)
    }

    /// Number of uploads outstanding.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

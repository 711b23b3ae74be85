//! Persisted cache state.
//!
//! The blob handed to the delegate is versioned JSON. Reports are written in
//! creation order; InFlight reports are written as Queued so that uploads
//! abandoned at shutdown are retried after restart. The attempt they were
//! on never produced an outcome, so it is not counted. Terminal and doomed
//! reports are omitted. Endpoint backoff is written as the delay remaining
//! at snapshot time, since monotonic ticks do not survive a restart.

use crate::cache::ReportingCache;
use crate::clock::Ticks;
use crate::error::{ReportingError, ReportingResult};
use crate::types::{
    BackoffState, EndpointClient, EndpointKey, Origin, Report, ReportId, ReportStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const PERSISTED_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub reports: Vec<PersistedReport>,
    pub endpoints: Vec<PersistedEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedReport {
    pub id: ReportId,
    pub url: Url,
    pub origin: Origin,
    pub group: String,
    #[serde(rename = "type")]
    pub report_type: String,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEndpoint {
    pub origin: Origin,
    pub group: String,
    pub url: Url,
    pub priority: u32,
    pub weight: u32,
    #[serde(default)]
    pub include_subdomains: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Backoff remaining when the snapshot was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_remaining_ms: Option<u64>,
}

/// What a restore kept and dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub reports: usize,
    pub endpoints: usize,
    pub dropped_reports: usize,
    pub dropped_endpoints: usize,
}

impl PersistedState {
    /// Captures the cache contents.
    pub fn snapshot(cache: &ReportingCache, now: DateTime<Utc>, ticks: Ticks) -> Self {
        let reports = cache
            .reports()
            .into_iter()
            .filter(|report| !report.status.is_terminal() && !report.is_doomed())
            .map(|report| PersistedReport {
                id: report.id,
                url: report.url.clone(),
                origin: report.origin.clone(),
                group: report.group.clone(),
                report_type: report.report_type.clone(),
                body: report.body.clone(),
                created_at: report.created_at,
                attempts: if report.status == ReportStatus::InFlight {
                    report.attempts.saturating_sub(1)
                } else {
                    report.attempts
                },
            })
            .collect();

        let endpoints = cache
            .endpoints()
            .filter(|client| !client.backoff.permanently_disabled)
            .map(|client| PersistedEndpoint {
                origin: client.key.origin.clone(),
                group: client.key.group.clone(),
                url: client.key.url.clone(),
                priority: client.priority,
                weight: client.weight,
                include_subdomains: client.include_subdomains,
                expires: client.expires,
                last_used: client.last_used,
                consecutive_failures: client.backoff.consecutive_failures,
                backoff_remaining_ms: client
                    .backoff
                    .next_eligible
                    .map(|at| ticks.until(at).as_millis() as u64)
                    .filter(|ms| *ms > 0),
            })
            .collect();

        Self {
            version: PERSISTED_STATE_VERSION,
            saved_at: now,
            reports,
            endpoints,
        }
    }

    pub fn to_bytes(&self) -> ReportingResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ReportingResult<Self> {
        let state: PersistedState = serde_json::from_slice(bytes)?;
        if state.version != PERSISTED_STATE_VERSION {
            return Err(ReportingError::Persistence(format!(
                "unsupported state version {}",
                state.version
            )));
        }
        Ok(state)
    }

    /// Loads the snapshot into `cache`.
    ///
    /// Reports past the age limit or out of attempts and expired endpoints
    /// are dropped. Capacity limits apply. The cache is left clean.
    pub fn restore_into(
        self,
        cache: &mut ReportingCache,
        now: DateTime<Utc>,
        ticks: Ticks,
        restore_reports: bool,
        restore_endpoints: bool,
    ) -> RestoreSummary {
        let mut summary = RestoreSummary::default();
        let max_age = cache.policy().max_report_age;
        let max_attempts = cache.policy().max_attempts;

        if restore_endpoints {
            for endpoint in self.endpoints {
                if endpoint.expires.is_some_and(|expires| expires <= now) {
                    summary.dropped_endpoints += 1;
                    continue;
                }
                let client = EndpointClient {
                    key: EndpointKey::new(endpoint.origin, endpoint.group, endpoint.url),
                    priority: endpoint.priority,
                    weight: endpoint.weight,
                    include_subdomains: endpoint.include_subdomains,
                    expires: endpoint.expires,
                    last_used: endpoint.last_used,
                    backoff: BackoffState {
                        consecutive_failures: endpoint.consecutive_failures,
                        next_eligible: endpoint
                            .backoff_remaining_ms
                            .map(|ms| ticks + Duration::from_millis(ms)),
                        permanently_disabled: false,
                    },
                };
                if cache.restore_endpoint(client) {
                    summary.endpoints += 1;
                } else {
                    summary.dropped_endpoints += 1;
                }
            }
        } else {
            summary.dropped_endpoints = self.endpoints.len();
        }

        if restore_reports {
            let mut reports = self.reports;
            reports.sort_by_key(|report| report.created_at);
            for persisted in reports {
                let report = Report {
                    id: persisted.id,
                    url: persisted.url,
                    origin: persisted.origin,
                    group: persisted.group,
                    report_type: persisted.report_type,
                    body: persisted.body,
                    created_at: persisted.created_at,
                    attempts: persisted.attempts,
                    status: ReportStatus::Queued,
                    seq: 0,
                    doomed: false,
                };
                if report.age(now) > max_age
                    || report.attempts >= max_attempts
                    || !cache.restore_report(report)
                {
                    summary.dropped_reports += 1;
                } else {
                    summary.reports += 1;
                }
            }
        } else {
            summary.dropped_reports = self.reports.len();
        }

        cache.take_dirty();
        debug!(
            reports = summary.reports,
            endpoints = summary.endpoints,
            dropped_reports = summary.dropped_reports,
            dropped_endpoints = summary.dropped_endpoints,
            "Restored persisted state"
        );
        summary
    }
}

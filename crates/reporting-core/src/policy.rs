//! Reporting policy.

use std::time::Duration;

/// Policy constants consumed by the cache, the endpoint manager and the
/// delivery agent.
///
/// The policy is immutable once a [`ReportingContext`](crate::ReportingContext)
/// has been built; components share it through an `Arc`.
///
/// # Backoff Calculation
///
/// After the k-th consecutive failure an endpoint is ineligible for
/// `min(backoff_base * 2^(k - 1), backoff_cap)`. With the defaults
/// (base=60s, cap=1h):
/// - 1st failure: 60s
/// - 2nd failure: 120s
/// - 3rd failure: 240s
/// - ... up to 3600s max
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportingPolicy {
    /// Maximum number of reports held across all origins.
    pub max_reports: usize,
    /// Maximum number of reports held for a single origin.
    pub max_reports_per_origin: usize,
    /// Maximum number of endpoint clients across all origins.
    pub max_endpoints: usize,
    /// Maximum number of endpoint clients for a single origin.
    pub max_endpoints_per_origin: usize,
    /// Reports older than this are removed by the maintenance pass.
    pub max_report_age: Duration,
    /// Upload attempts allowed per report before it is discarded.
    pub max_attempts: u32,
    /// Endpoints not used or refreshed for this long are removed.
    pub max_endpoint_group_staleness: Duration,
    /// Delay after the first consecutive failure.
    pub backoff_base: Duration,
    /// Upper bound on the backoff delay.
    pub backoff_cap: Duration,
    /// An endpoint failing more than this many times in a row is disabled
    /// and removed.
    pub max_consecutive_failures: u32,
    /// Maximum reports carried by a single upload.
    pub max_reports_per_upload: usize,
    /// Maximum uploads outstanding at once, across all endpoints.
    pub max_concurrent_uploads: usize,
    /// Interval between scheduled delivery rounds.
    pub delivery_interval: Duration,
    /// Interval between garbage collection passes.
    pub garbage_collection_interval: Duration,
    /// Interval between persistence checks.
    pub persistence_interval: Duration,
    /// Restore queued reports from the delegate at startup.
    pub persist_reports_across_restarts: bool,
    /// Restore endpoint clients from the delegate at startup.
    pub persist_endpoints_across_restarts: bool,
    /// Drop all reports when the network changes.
    pub clear_reports_on_network_change: bool,
    /// Drop all endpoint clients when the network changes.
    pub clear_endpoints_on_network_change: bool,
}

impl Default for ReportingPolicy {
    fn default() -> Self {
        Self {
            max_reports: 100,
            max_reports_per_origin: 50,
            max_endpoints: 1000,
            max_endpoints_per_origin: 40,
            max_report_age: Duration::from_secs(15 * 60),
            max_attempts: 5,
            max_endpoint_group_staleness: Duration::from_secs(7 * 24 * 60 * 60),
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(60 * 60),
            max_consecutive_failures: 10,
            max_reports_per_upload: 100,
            max_concurrent_uploads: 4,
            delivery_interval: Duration::from_secs(60),
            garbage_collection_interval: Duration::from_secs(5 * 60),
            persistence_interval: Duration::from_secs(60),
            persist_reports_across_restarts: true,
            persist_endpoints_across_restarts: true,
            clear_reports_on_network_change: true,
            clear_endpoints_on_network_change: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_bounds() {
        let policy = ReportingPolicy::default();
        assert!(policy.max_reports_per_origin <= policy.max_reports);
        assert!(policy.max_endpoints_per_origin <= policy.max_endpoints);
        assert!(policy.backoff_base <= policy.backoff_cap);
        assert!(policy.max_attempts > 0);
        assert!(policy.max_concurrent_uploads > 0);
    }

    #[test]
    fn test_policy_override() {
        let policy = ReportingPolicy {
            max_reports_per_origin: 2,
            max_attempts: 2,
            ..Default::default()
        };
        assert_eq!(policy.max_reports_per_origin, 2);
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.max_reports, 100);
    }
}

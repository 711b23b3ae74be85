//! Configuration management for the daemon.

use crate::paths::Paths;
use anyhow::{bail, Result};
use reporting_core::ReportingPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable overriding `log_level`.
pub const LOG_LEVEL_ENV: &str = "REPORTING_LOG_LEVEL";

/// Main daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Emit JSON lines instead of the compact human format.
    pub json_logs: bool,
    /// Write logs to `logs/reportingd.log` instead of stderr.
    pub log_to_file: bool,
    /// Persisted cache location. Defaults to `state.json` in the base directory.
    pub state_file: Option<PathBuf>,
    /// Fixed seed for endpoint tie-breaks. Random when unset.
    pub rng_seed: Option<u64>,
    /// How long shutdown waits for in-flight uploads.
    pub shutdown_grace_secs: u64,
    /// Per-request upload timeout.
    pub upload_timeout_secs: u64,
    pub policy: PolicyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            json_logs: false,
            log_to_file: false,
            state_file: None,
            rng_seed: None,
            shutdown_grace_secs: 5,
            upload_timeout_secs: 30,
            policy: PolicyConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the base directory, falling back to defaults.
    pub fn load(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the base directory.
    pub fn save(&self, paths: &Paths) -> Result<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Only the log level can be overridden from the environment.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var(LOG_LEVEL_ENV) {
            if !log_level.trim().is_empty() {
                self.log_level = log_level.trim().to_string();
            }
        }
    }

    pub fn state_file(&self, paths: &Paths) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| paths.state_file())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Policy knobs in file-friendly units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_reports: usize,
    pub max_reports_per_origin: usize,
    pub max_endpoints: usize,
    pub max_endpoints_per_origin: usize,
    pub max_report_age_secs: u64,
    pub max_attempts: u32,
    pub max_endpoint_group_staleness_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_consecutive_failures: u32,
    pub max_reports_per_upload: usize,
    pub max_concurrent_uploads: usize,
    pub delivery_interval_ms: u64,
    pub garbage_collection_interval_ms: u64,
    pub persistence_interval_ms: u64,
    pub persist_reports_across_restarts: bool,
    pub persist_endpoints_across_restarts: bool,
    pub clear_reports_on_network_change: bool,
    pub clear_endpoints_on_network_change: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self::from(&ReportingPolicy::default())
    }
}

impl From<&ReportingPolicy> for PolicyConfig {
    fn from(policy: &ReportingPolicy) -> Self {
        Self {
            max_reports: policy.max_reports,
            max_reports_per_origin: policy.max_reports_per_origin,
            max_endpoints: policy.max_endpoints,
            max_endpoints_per_origin: policy.max_endpoints_per_origin,
            max_report_age_secs: policy.max_report_age.as_secs(),
            max_attempts: policy.max_attempts,
            max_endpoint_group_staleness_secs: policy.max_endpoint_group_staleness.as_secs(),
            backoff_base_ms: millis(policy.backoff_base),
            backoff_cap_ms: millis(policy.backoff_cap),
            max_consecutive_failures: policy.max_consecutive_failures,
            max_reports_per_upload: policy.max_reports_per_upload,
            max_concurrent_uploads: policy.max_concurrent_uploads,
            delivery_interval_ms: millis(policy.delivery_interval),
            garbage_collection_interval_ms: millis(policy.garbage_collection_interval),
            persistence_interval_ms: millis(policy.persistence_interval),
            persist_reports_across_restarts: policy.persist_reports_across_restarts,
            persist_endpoints_across_restarts: policy.persist_endpoints_across_restarts,
            clear_reports_on_network_change: policy.clear_reports_on_network_change,
            clear_endpoints_on_network_change: policy.clear_endpoints_on_network_change,
        }
    }
}

impl PolicyConfig {
    /// Converts to a runtime policy, rejecting values the scheduler cannot run with.
    pub fn to_policy(&self) -> Result<ReportingPolicy> {
        for (name, value) in [
            ("delivery_interval_ms", self.delivery_interval_ms),
            ("garbage_collection_interval_ms", self.garbage_collection_interval_ms),
            ("persistence_interval_ms", self.persistence_interval_ms),
            ("max_reports_per_upload", self.max_reports_per_upload as u64),
            ("max_concurrent_uploads", self.max_concurrent_uploads as u64),
            ("max_attempts", self.max_attempts as u64),
            ("max_reports", self.max_reports as u64),
            ("max_reports_per_origin", self.max_reports_per_origin as u64),
            ("max_endpoints", self.max_endpoints as u64),
            ("max_endpoints_per_origin", self.max_endpoints_per_origin as u64),
        ] {
            if value == 0 {
                bail!("policy.{} must be greater than zero", name);
            }
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            bail!("policy.backoff_cap_ms must not be below policy.backoff_base_ms");
        }

        Ok(ReportingPolicy {
            max_reports: self.max_reports,
            max_reports_per_origin: self.max_reports_per_origin,
            max_endpoints: self.max_endpoints,
            max_endpoints_per_origin: self.max_endpoints_per_origin,
            max_report_age: Duration::from_secs(self.max_report_age_secs),
            max_attempts: self.max_attempts,
            max_endpoint_group_staleness: Duration::from_secs(
                self.max_endpoint_group_staleness_secs,
            ),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            max_consecutive_failures: self.max_consecutive_failures,
            max_reports_per_upload: self.max_reports_per_upload,
            max_concurrent_uploads: self.max_concurrent_uploads,
            delivery_interval: Duration::from_millis(self.delivery_interval_ms),
            garbage_collection_interval: Duration::from_millis(
                self.garbage_collection_interval_ms,
            ),
            persistence_interval: Duration::from_millis(self.persistence_interval_ms),
            persist_reports_across_restarts: self.persist_reports_across_restarts,
            persist_endpoints_across_restarts: self.persist_endpoints_across_restarts,
            clear_reports_on_network_change: self.clear_reports_on_network_change,
            clear_endpoints_on_network_change: self.clear_endpoints_on_network_change,
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

//! Logging initialization for the daemon.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and one
//! formatting layer: compact text or JSON lines, on stderr or appended
//! to a log file. `RUST_LOG` takes precedence over the configured level.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Where and how log lines are written.
#[derive(Debug, Clone, Default)]
pub struct LogOptions<'a> {
    pub level: &'a str,
    pub json: bool,
    /// Append to this file instead of writing to stderr.
    pub file: Option<&'a Path>,
}

/// Builds the filter: `RUST_LOG` if set and valid, else `level`.
pub fn env_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level: {}", level))
}

/// Initialize the global subscriber. Fails if one is already installed.
pub fn init_logging(options: LogOptions<'_>) -> Result<()> {
    let filter = env_filter(options.level)?;

    let layer = match (options.file, options.json) {
        (None, false) => tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(std::io::stderr)
            .boxed(),
        (None, true) => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        (Some(path), false) => tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_ansi(false)
            .with_writer(Mutex::new(open_log_file(path)?))
            .boxed(),
        (Some(path), true) => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(Mutex::new(open_log_file(path)?))
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(
        json = options.json,
        file = options.file.map(|p| p.display().to_string()),
        "logging initialized"
    );
    Ok(())
}

/// Opens `path` for appending, creating parent directories.
pub fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn open_log_file_creates_parents_and_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("reportingd.log");

        open_log_file(&path).unwrap().write_all(b"one\n").unwrap();
        open_log_file(&path).unwrap().write_all(b"two\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn env_filter_accepts_levels() {
        for level in ["trace", "debug", "info", "warn", "error", "reporting_core=debug"] {
            assert!(env_filter(level).is_ok(), "{}", level);
        }
    }
}

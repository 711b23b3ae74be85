//! Summaries of a persisted state file.

use anyhow::{Context, Result};
use reporting_core::PersistedState;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub fn load_state(path: &Path) -> Result<PersistedState> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    PersistedState::from_bytes(&bytes)
        .with_context(|| format!("Failed to decode {}", path.display()))
}

pub fn summarize(state: &PersistedState) -> Value {
    let mut reports_by_origin: BTreeMap<&str, usize> = BTreeMap::new();
    for report in &state.reports {
        *reports_by_origin.entry(report.origin.as_str()).or_default() += 1;
    }

    let endpoints: Vec<Value> = state
        .endpoints
        .iter()
        .map(|endpoint| {
            json!({
                "origin": endpoint.origin.as_str(),
                "group": endpoint.group,
                "url": endpoint.url.as_str(),
                "priority": endpoint.priority,
                "weight": endpoint.weight,
                "consecutive_failures": endpoint.consecutive_failures,
                "backoff_remaining_ms": endpoint.backoff_remaining_ms,
            })
        })
        .collect();

    json!({
        "version": state.version,
        "saved_at": state.saved_at.to_rfc3339(),
        "reports": state.reports.len(),
        "reports_by_origin": reports_by_origin,
        "endpoints": endpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reporting_core::{
        EndpointRegistration, NewReport, NullObserver, Origin, ReportingCache, ReportingPolicy,
        Ticks,
    };
    use std::sync::Arc;
    use tempfile::tempdir;
    use url::Url;

    #[test]
    fn summarize_counts_reports_per_origin() {
        let now = Utc::now();
        let mut cache = ReportingCache::new(
            Arc::new(ReportingPolicy::default()),
            Arc::new(NullObserver),
        );
        for page in ["https://a.example/1", "https://a.example/2", "https://b.example/"] {
            let url = Url::parse(page).unwrap();
            cache
                .add_report(
                    NewReport::new(&url, "default", "test", json!({})).unwrap(),
                    now,
                )
                .unwrap();
        }
        cache
            .upsert_endpoint(
                EndpointRegistration::new(
                    Origin::parse("https://a.example").unwrap(),
                    "default",
                    Url::parse("https://c.example/up").unwrap(),
                ),
                now,
            )
            .unwrap();

        let state = PersistedState::snapshot(&cache, now, Ticks::default());
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, state.to_bytes().unwrap()).unwrap();

        let summary = summarize(&load_state(&path).unwrap());
        assert_eq!(summary["reports"], 3);
        assert_eq!(summary["reports_by_origin"]["https://a.example"], 2);
        assert_eq!(summary["reports_by_origin"]["https://b.example"], 1);
        assert_eq!(summary["endpoints"][0]["url"], "https://c.example/up");
    }

    #[test]
    fn load_state_reports_missing_file() {
        let dir = tempdir().unwrap();
        assert!(load_state(&dir.path().join("missing.json")).is_err());
    }
}

//! Uploader capability and upload payload encoding.

use crate::error::ReportingResult;
use crate::types::Report;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

/// Result of one upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The endpoint accepted the batch.
    Success,
    /// Transient failure (network error, timeout, 5xx); reports may be retried.
    RetryableFailure,
    /// The endpoint rejected the batch; reports are discarded.
    PermanentFailure,
}

impl UploadOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadOutcome::Success => "success",
            UploadOutcome::RetryableFailure => "retryable_failure",
            UploadOutcome::PermanentFailure => "permanent_failure",
        }
    }
}

/// Transfers a serialized batch to an endpoint.
///
/// Implementations own transport concerns, including the upload timeout;
/// a timed-out upload must resolve to [`UploadOutcome::RetryableFailure`].
#[async_trait]
pub trait ReportingUploader: Send + Sync {
    async fn upload(&self, url: &Url, payload: String) -> UploadOutcome;
}

#[derive(Serialize)]
struct ReportPayload<'a> {
    /// Milliseconds between report creation and upload.
    age: u64,
    #[serde(rename = "type")]
    report_type: &'a str,
    url: &'a str,
    body: &'a serde_json::Value,
}

/// Encodes reports as the JSON array uploaded to endpoints.
pub fn serialize_reports<'a, I>(reports: I, now: DateTime<Utc>) -> ReportingResult<String>
where
    I: IntoIterator<Item = &'a Report>,
{
    let payload: Vec<ReportPayload<'a>> = reports
        .into_iter()
        .map(|report| ReportPayload {
            age: report.age(now).as_millis() as u64,
            report_type: &report.report_type,
            url: report.url.as_str(),
            body: &report.body,
        })
        .collect();
    Ok(serde_json::to_string(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewReport;
    use serde_json::{json, Value};

    #[test]
    fn payload_carries_age_type_url_and_body() {
        let created = Utc::now();
        let url = Url::parse("https://site.example/page?x=1").unwrap();
        let report = NewReport::new(&url, "default", "deprecation", json!({"id": "old-api"}))
            .unwrap()
            .into_report(created);

        let payload =
            serialize_reports([&report], created + chrono::Duration::milliseconds(1500)).unwrap();
        let parsed: Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(
            parsed,
            json!([{
                "age": 1500,
                "type": "deprecation",
                "url": "https://site.example/page?x=1",
                "body": {"id": "old-api"}
            }])
        );
    }

    #[test]
    fn empty_batch_is_empty_array() {
        let payload = serialize_reports(std::iter::empty(), Utc::now()).unwrap();
        assert_eq!(payload, "[]");
    }
}

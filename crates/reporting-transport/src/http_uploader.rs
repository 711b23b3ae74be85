//! HTTP uploader.

use crate::error::TransportResult;
use async_trait::async_trait;
use reporting_core::{ReportingUploader, UploadOutcome};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const REPORTS_CONTENT_TYPE: &str = "application/reports+json";

/// Uploader configuration.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Request timeout in seconds. A timed-out upload is retryable.
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: concat!("reportingd/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Maps an HTTP response status to an upload outcome.
///
/// 2xx is success. Statuses that say the endpoint will never accept this
/// payload are permanent; everything else is worth retrying.
pub fn classify_status(status: StatusCode) -> UploadOutcome {
    if status.is_success() {
        return UploadOutcome::Success;
    }
    match status.as_u16() {
        400 | 404 | 410 | 413 | 415 | 422 => UploadOutcome::PermanentFailure,
        _ => UploadOutcome::RetryableFailure,
    }
}

/// Uploads report batches with an HTTP POST.
pub struct HttpUploader {
    client: Client,
}

impl HttpUploader {
    pub fn new(config: UploaderConfig) -> TransportResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReportingUploader for HttpUploader {
    async fn upload(&self, url: &Url, payload: String) -> UploadOutcome {
        let bytes = payload.len();
        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, REPORTS_CONTENT_TYPE)
            .body(payload)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let outcome = classify_status(status);
                debug!(
                    url = %url,
                    status = status.as_u16(),
                    bytes,
                    outcome = outcome.as_str(),
                    "Upload finished"
                );
                outcome
            }
            Err(e) => {
                warn!(url = %url, timeout = e.is_timeout(), error = %e, "Upload request failed");
                UploadOutcome::RetryableFailure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Accepts one connection, answers with `status_line`, and returns the raw request.
    async fn serve_once(status_line: &'static str) -> (Url, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|line| {
                            let lower = line.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|value| value.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            let response = format!("{}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status_line);
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        let url = Url::parse(&format!("http://{}/reports", addr)).unwrap();
        (url, handle)
    }

    fn uploader() -> HttpUploader {
        HttpUploader::new(UploaderConfig {
            timeout_secs: 5,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn classify_status_codes() {
        assert_eq!(classify_status(StatusCode::OK), UploadOutcome::Success);
        assert_eq!(classify_status(StatusCode::NO_CONTENT), UploadOutcome::Success);
        assert_eq!(
            classify_status(StatusCode::GONE),
            UploadOutcome::PermanentFailure
        );
        assert_eq!(
            classify_status(StatusCode::PAYLOAD_TOO_LARGE),
            UploadOutcome::PermanentFailure
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            UploadOutcome::RetryableFailure
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            UploadOutcome::RetryableFailure
        );
        assert_eq!(
            classify_status(StatusCode::MOVED_PERMANENTLY),
            UploadOutcome::RetryableFailure
        );
    }

    #[tokio::test]
    async fn upload_posts_reports_json() {
        let (url, server) = serve_once("HTTP/1.1 204 No Content").await;
        let payload = r#"[{"age":1,"type":"test","url":"https://a.example/","body":{}}]"#;

        let outcome = uploader().upload(&url, payload.to_string()).await;
        assert_eq!(outcome, UploadOutcome::Success);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /reports HTTP/1.1"));
        assert!(request
            .to_ascii_lowercase()
            .contains("content-type: application/reports+json"));
        assert!(request.ends_with(payload));
    }

    #[tokio::test]
    async fn upload_maps_rejection_to_permanent_failure() {
        let (url, server) = serve_once("HTTP/1.1 410 Gone").await;
        let outcome = uploader().upload(&url, "[]".to_string()).await;
        assert_eq!(outcome, UploadOutcome::PermanentFailure);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn upload_maps_server_error_to_retryable_failure() {
        let (url, server) = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let outcome = uploader().upload(&url, "[]".to_string()).await;
        assert_eq!(outcome, UploadOutcome::RetryableFailure);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connection_failure_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{}/reports", addr)).unwrap();
        let outcome = uploader().upload(&url, "[]".to_string()).await;
        assert_eq!(outcome, UploadOutcome::RetryableFailure);
    }
}

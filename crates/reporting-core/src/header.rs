//! `Report-To` header parsing.
//!
//! The header value is a comma-separated list of JSON objects:
//!
//! ```text
//! Report-To: {"group":"csp","max_age":86400,"endpoints":[{"url":"https://r.example/csp"}]},
//!            {"max_age":0}
//! ```
//!
//! Entries that fail validation are skipped one by one; only a value that
//! is not JSON at all fails the whole header.

use crate::error::{ReportingError, ReportingResult};
use crate::types::{EndpointRegistration, Origin};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;
use url::{Host, Url};

pub const DEFAULT_GROUP: &str = "default";

/// One endpoint group declared by a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointGroupHeader {
    pub group: String,
    /// Zero means "forget this group".
    pub max_age: Duration,
    pub include_subdomains: bool,
    pub endpoints: Vec<EndpointHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointHeader {
    pub url: Url,
    pub priority: u32,
    pub weight: u32,
}

impl EndpointGroupHeader {
    pub fn is_removal(&self) -> bool {
        self.max_age.is_zero()
    }

    /// Registrations for the group's endpoints under `origin`.
    pub fn registrations(&self, origin: &Origin) -> Vec<EndpointRegistration> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                EndpointRegistration::new(origin.clone(), self.group.clone(), endpoint.url.clone())
                    .with_priority(endpoint.priority)
                    .with_weight(endpoint.weight)
                    .with_include_subdomains(self.include_subdomains)
                    .with_max_age(self.max_age)
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct RawGroup {
    #[serde(default = "default_group")]
    group: String,
    max_age: u64,
    #[serde(default)]
    include_subdomains: bool,
    #[serde(default)]
    endpoints: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawEndpoint {
    url: String,
    #[serde(default = "default_one")]
    priority: u32,
    #[serde(default = "default_one")]
    weight: u32,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_one() -> u32 {
    1
}

/// True for `https`/`wss` URLs and for `http`/`ws` URLs on a loopback host.
pub fn is_potentially_trustworthy(url: &Url) -> bool {
    match url.scheme() {
        "https" | "wss" => true,
        "http" | "ws" => match url.host() {
            Some(Host::Domain(domain)) => {
                domain == "localhost" || domain.ends_with(".localhost")
            }
            Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
            Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
            None => false,
        },
        _ => false,
    }
}

/// Parses a `Report-To` value received on the document at `document_url`.
pub fn parse_report_to(document_url: &Url, value: &str) -> ReportingResult<Vec<EndpointGroupHeader>> {
    if !is_potentially_trustworthy(document_url) {
        return Err(ReportingError::InvalidHeader(format!(
            "document {} is not secure",
            document_url
        )));
    }

    let entries: Vec<serde_json::Value> = serde_json::from_str(&format!("[{}]", value))
        .map_err(|e| ReportingError::InvalidHeader(e.to_string()))?;

    let mut groups: Vec<EndpointGroupHeader> = Vec::new();
    for entry in entries {
        let raw: RawGroup = match serde_json::from_value(entry) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "Skipping malformed Report-To entry");
                continue;
            }
        };
        if raw.group.is_empty() {
            debug!("Skipping Report-To entry with empty group");
            continue;
        }
        if groups.iter().any(|group| group.group == raw.group) {
            debug!(group = %raw.group, "Skipping duplicate Report-To group");
            continue;
        }

        let max_age = Duration::from_secs(raw.max_age);
        let endpoints = if max_age.is_zero() {
            Vec::new()
        } else {
            let endpoints = parse_endpoints(document_url, &raw.group, raw.endpoints);
            if endpoints.is_empty() {
                debug!(group = %raw.group, "Skipping Report-To group without valid endpoints");
                continue;
            }
            endpoints
        };

        groups.push(EndpointGroupHeader {
            group: raw.group,
            max_age,
            include_subdomains: raw.include_subdomains,
            endpoints,
        });
    }
    Ok(groups)
}

fn parse_endpoints(
    document_url: &Url,
    group: &str,
    values: Vec<serde_json::Value>,
) -> Vec<EndpointHeader> {
    let mut endpoints: Vec<EndpointHeader> = Vec::new();
    for value in values {
        let raw: RawEndpoint = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(group, error = %e, "Skipping malformed endpoint");
                continue;
            }
        };
        let url = match document_url.join(&raw.url) {
            Ok(url) => url,
            Err(e) => {
                debug!(group, url = %raw.url, error = %e, "Skipping unparsable endpoint URL");
                continue;
            }
        };
        if !is_potentially_trustworthy(&url) {
            debug!(group, url = %url, "Skipping insecure endpoint URL");
            continue;
        }
        if endpoints.iter().any(|endpoint| endpoint.url == url) {
            continue;
        }
        endpoints.push(EndpointHeader {
            url,
            priority: raw.priority,
            weight: raw.weight,
        });
    }
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Url {
        Url::parse("https://site.example/page").unwrap()
    }

    #[test]
    fn parses_groups_with_defaults() {
        let value = r#"{"max_age":86400,"endpoints":[{"url":"https://r.example/a"}]},
            {"group":"csp","max_age":60,"include_subdomains":true,
             "endpoints":[{"url":"/csp","priority":2,"weight":5}]}"#;
        let groups = parse_report_to(&doc(), value).unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group, DEFAULT_GROUP);
        assert_eq!(groups[0].max_age, Duration::from_secs(86400));
        assert_eq!(groups[0].endpoints[0].priority, 1);
        assert_eq!(groups[0].endpoints[0].weight, 1);

        assert_eq!(groups[1].group, "csp");
        assert!(groups[1].include_subdomains);
        assert_eq!(
            groups[1].endpoints[0].url.as_str(),
            "https://site.example/csp"
        );
        assert_eq!(groups[1].endpoints[0].priority, 2);
        assert_eq!(groups[1].endpoints[0].weight, 5);
    }

    #[test]
    fn zero_max_age_is_removal() {
        let groups = parse_report_to(&doc(), r#"{"group":"old","max_age":0}"#).unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_removal());
        assert!(groups[0].endpoints.is_empty());
    }

    #[test]
    fn invalid_entries_are_skipped_individually() {
        let value = r#"{"max_age":-1,"endpoints":[{"url":"https://r.example/neg"}]},
            {"group":"nourl","max_age":10,"endpoints":[{"priority":1}]},
            {"group":"insecure","max_age":10,"endpoints":[{"url":"http://r.example/x"}]},
            {"group":"ok","max_age":10,"endpoints":[{"url":"http://r.example/x"},{"url":"https://r.example/ok"}]}"#;
        let groups = parse_report_to(&doc(), value).unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group, "ok");
        assert_eq!(groups[0].endpoints.len(), 1);
    }

    #[test]
    fn rejects_non_json_and_insecure_documents() {
        assert!(matches!(
            parse_report_to(&doc(), "not json"),
            Err(ReportingError::InvalidHeader(_))
        ));
        let insecure = Url::parse("http://site.example/").unwrap();
        assert!(matches!(
            parse_report_to(&insecure, r#"{"max_age":1,"endpoints":[]}"#),
            Err(ReportingError::InvalidHeader(_))
        ));
    }

    #[test]
    fn loopback_http_is_trustworthy() {
        for url in ["http://localhost:8080/", "http://127.0.0.1/", "http://[::1]/", "https://x.example/"] {
            assert!(is_potentially_trustworthy(&Url::parse(url).unwrap()), "{url}");
        }
        for url in ["http://example.com/", "ftp://localhost/", "data:text/plain,x"] {
            assert!(!is_potentially_trustworthy(&Url::parse(url).unwrap()), "{url}");
        }
    }

    #[test]
    fn registrations_carry_group_settings() {
        let groups = parse_report_to(
            &doc(),
            r#"{"group":"g","max_age":30,"include_subdomains":true,"endpoints":[{"url":"https://r.example/"}]}"#,
        )
        .unwrap();
        let origin = Origin::parse("https://site.example").unwrap();
        let regs = groups[0].registrations(&origin);

        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].group, "g");
        assert!(regs[0].include_subdomains);
        assert_eq!(regs[0].max_age, Some(Duration::from_secs(30)));
    }
}

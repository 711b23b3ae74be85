//! Core data model: origins, reports and endpoint clients.

use crate::clock::Ticks;
use crate::error::{ReportingError, ReportingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

/// A tuple origin (`scheme://host[:port]`) in its ASCII serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Origin(String);

impl Origin {
    /// Origin of `url`. Opaque origins (`data:`, `file:`, ...) are rejected.
    pub fn from_url(url: &Url) -> ReportingResult<Self> {
        match url.origin() {
            origin @ url::Origin::Tuple(..) => Ok(Self(origin.ascii_serialization())),
            url::Origin::Opaque(_) => Err(ReportingError::InvalidOrigin(url.to_string())),
        }
    }

    /// Parses an origin from a URL string.
    pub fn parse(input: &str) -> ReportingResult<Self> {
        Self::from_url(&Url::parse(input)?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Origins of every registrable superdomain of this origin's host, with
    /// the same scheme and port, nearest first.
    ///
    /// `https://a.b.example.com` yields `https://b.example.com` and
    /// `https://example.com`. IP-address hosts have no superdomains.
    pub fn superdomains(&self) -> Vec<Origin> {
        let Ok(url) = Url::parse(&self.0) else {
            return Vec::new();
        };
        let Some(url::Host::Domain(host)) = url.host() else {
            return Vec::new();
        };

        let mut result = Vec::new();
        let mut rest = host;
        while let Some((_, parent)) = rest.split_once('.') {
            if !parent.contains('.') {
                break;
            }
            let mut candidate = url.clone();
            if candidate.set_host(Some(parent)).is_ok() {
                result.push(Origin(candidate.origin().ascii_serialization()));
            }
            rest = parent;
        }
        result
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique report identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(Uuid);

impl ReportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An (origin, endpoint group) pair that reports are addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub origin: Origin,
    pub group: String,
}

impl Destination {
    pub fn new(origin: Origin, group: impl Into<String>) -> Self {
        Self {
            origin,
            group: group.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.group)
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Delivery status of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// Waiting for a delivery round.
    Queued,
    /// Part of an outstanding upload.
    InFlight,
    /// Accepted by an endpoint; removed by the next maintenance pass.
    Delivered,
    /// Given up on; removed by the next maintenance pass.
    Discarded,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Queued => "queued",
            ReportStatus::InFlight => "in_flight",
            ReportStatus::Delivered => "delivered",
            ReportStatus::Discarded => "discarded",
        }
    }

    /// Delivered and Discarded never return to Queued.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Delivered | ReportStatus::Discarded)
    }
}

/// A report submitted by upstream code, before it enters the cache.
#[derive(Debug, Clone)]
pub struct NewReport {
    url: Url,
    origin: Origin,
    group: String,
    report_type: String,
    body: serde_json::Value,
}

impl NewReport {
    /// Builds a report for the document at `url`.
    ///
    /// Credentials and fragment are stripped from the URL before it is
    /// stored or uploaded.
    pub fn new(
        url: &Url,
        group: impl Into<String>,
        report_type: impl Into<String>,
        body: serde_json::Value,
    ) -> ReportingResult<Self> {
        let origin = Origin::from_url(url)?;
        let mut url = url.clone();
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_fragment(None);

        Ok(Self {
            url,
            origin,
            group: group.into(),
            report_type: report_type.into(),
            body,
        })
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub(crate) fn into_report(self, created_at: DateTime<Utc>) -> Report {
        Report {
            id: ReportId::new(),
            url: self.url,
            origin: self.origin,
            group: self.group,
            report_type: self.report_type,
            body: self.body,
            created_at,
            attempts: 0,
            status: ReportStatus::Queued,
            seq: 0,
            doomed: false,
        }
    }
}

/// A report held by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub id: ReportId,
    /// Document URL that generated the report.
    pub url: Url,
    pub origin: Origin,
    /// Endpoint group the report is addressed to.
    pub group: String,
    /// Report type tag, e.g. "csp-violation".
    pub report_type: String,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Uploads started for this report.
    pub attempts: u32,
    pub status: ReportStatus,
    /// Insertion order; breaks creation-time ties.
    pub(crate) seq: u64,
    /// Removal was requested while the report was in flight.
    pub(crate) doomed: bool,
}

impl Report {
    pub fn destination(&self) -> Destination {
        Destination::new(self.origin.clone(), self.group.clone())
    }

    /// Age of the report at `now`, zero if the clock went backwards.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed
    }
}

// =============================================================================
// Endpoints
// =============================================================================

/// Identity of an endpoint client: (origin, group, URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub origin: Origin,
    pub group: String,
    pub url: Url,
}

impl EndpointKey {
    pub fn new(origin: Origin, group: impl Into<String>, url: Url) -> Self {
        Self {
            origin,
            group: group.into(),
            url,
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} -> {}", self.origin, self.group, self.url)
    }
}

/// Per-endpoint health tracking, mutated only by the endpoint manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackoffState {
    pub consecutive_failures: u32,
    /// The endpoint is not selected before this time.
    pub next_eligible: Option<Ticks>,
    pub permanently_disabled: bool,
}

impl BackoffState {
    pub fn is_eligible(&self, now: Ticks) -> bool {
        !self.permanently_disabled && self.next_eligible.map_or(true, |at| at <= now)
    }
}

/// A registered endpoint for an (origin, group).
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointClient {
    pub key: EndpointKey,
    /// Lower values are preferred.
    pub priority: u32,
    /// Higher values are preferred among equal priorities.
    pub weight: u32,
    /// Also serves subdomains of the origin.
    pub include_subdomains: bool,
    /// Registration lifetime; `None` never expires.
    pub expires: Option<DateTime<Utc>>,
    pub last_used: DateTime<Utc>,
    pub backoff: BackoffState,
}

impl EndpointClient {
    pub fn origin(&self) -> &Origin {
        &self.key.origin
    }

    pub fn group(&self) -> &str {
        &self.key.group
    }

    pub fn url(&self) -> &Url {
        &self.key.url
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

/// Upstream request to register (or refresh) an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointRegistration {
    pub origin: Origin,
    pub group: String,
    pub url: Url,
    pub priority: u32,
    pub weight: u32,
    pub include_subdomains: bool,
    pub max_age: Option<Duration>,
}

impl EndpointRegistration {
    /// Registration with priority 1, weight 1 and no expiry.
    pub fn new(origin: Origin, group: impl Into<String>, url: Url) -> Self {
        Self {
            origin,
            group: group.into(),
            url,
            priority: 1,
            weight: 1,
            include_subdomains: false,
            max_age: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_include_subdomains(mut self, include_subdomains: bool) -> Self {
        self.include_subdomains = include_subdomains;
        self
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey::new(self.origin.clone(), self.group.clone(), self.url.clone())
    }

    pub(crate) fn into_client(self, now: DateTime<Utc>) -> EndpointClient {
        let expires = self
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .and_then(|age| now.checked_add_signed(age));

        EndpointClient {
            key: EndpointKey::new(self.origin, self.group, self.url),
            priority: self.priority,
            weight: self.weight,
            include_subdomains: self.include_subdomains,
            expires,
            last_used: now,
            backoff: BackoffState::default(),
        }
    }
}

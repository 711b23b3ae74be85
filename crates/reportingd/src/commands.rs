//! JSON-lines command feed.
//!
//! Each input line is one command object tagged by `cmd`; each produces
//! one JSON response line.
//!
//! ```text
//! {"cmd":"register","origin":"https://a.example","url":"https://collector.example/up"}
//! {"cmd":"report","url":"https://a.example/page","type":"deprecation","body":{"id":"x"}}
//! {"cmd":"header","url":"https://a.example/","value":"{\"max_age\":86400,\"endpoints\":[...]}"}
//! {"cmd":"deliver"}
//! ```

use reporting_core::{
    DataTypes, EndpointKey, EndpointRegistration, Origin, ReportStatus, ReportingContext,
    ReportingResult, DEFAULT_GROUP,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

/// A command read from the feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Register one endpoint for an origin's group.
    Register {
        origin: String,
        #[serde(default = "default_group")]
        group: String,
        url: Url,
        #[serde(default = "default_priority")]
        priority: u32,
        #[serde(default = "default_weight")]
        weight: u32,
        max_age_secs: Option<u64>,
        #[serde(default)]
        include_subdomains: bool,
    },
    Unregister {
        origin: String,
        #[serde(default = "default_group")]
        group: String,
        url: Url,
    },
    /// Queue a report generated by the document at `url`.
    Report {
        url: Url,
        #[serde(default = "default_group")]
        group: String,
        #[serde(rename = "type")]
        report_type: String,
        #[serde(default)]
        body: Value,
    },
    /// Apply a `Report-To` header value received for `url`.
    Header { url: Url, value: String },
    Deliver,
    Gc,
    Persist,
    NetworkChanged,
    /// Remove reports and endpoints, for one origin or all.
    Clear { origin: Option<String> },
    Status,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_priority() -> u32 {
    1
}

fn default_weight() -> u32 {
    1
}

/// Parses and executes one line. Errors become `{"ok":false,"error":..}`.
pub fn handle_line(context: &ReportingContext, line: &str) -> Value {
    let command = match serde_json::from_str::<Command>(line) {
        Ok(command) => command,
        Err(e) => return json!({ "ok": false, "error": format!("bad command: {}", e) }),
    };
    match execute(context, command) {
        Ok(mut response) => {
            if let Value::Object(map) = &mut response {
                map.insert("ok".to_string(), Value::Bool(true));
            }
            response
        }
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    }
}

pub fn execute(context: &ReportingContext, command: Command) -> ReportingResult<Value> {
    match command {
        Command::Register {
            origin,
            group,
            url,
            priority,
            weight,
            max_age_secs,
            include_subdomains,
        } => {
            let mut registration = EndpointRegistration::new(Origin::parse(&origin)?, group, url)
                .with_priority(priority)
                .with_weight(weight)
                .with_include_subdomains(include_subdomains);
            if let Some(secs) = max_age_secs {
                registration = registration.with_max_age(Duration::from_secs(secs));
            }
            context.register_endpoint(registration)?;
            Ok(json!({}))
        }
        Command::Unregister { origin, group, url } => {
            let key = EndpointKey::new(Origin::parse(&origin)?, group, url);
            Ok(json!({ "removed": context.unregister_endpoint(&key) }))
        }
        Command::Report {
            url,
            group,
            report_type,
            body,
        } => {
            let id = context.queue_report(&url, &group, &report_type, body)?;
            Ok(json!({ "id": id.to_string() }))
        }
        Command::Header { url, value } => {
            let groups = context.process_header(&url, &value)?;
            Ok(json!({ "groups": groups }))
        }
        Command::Deliver => {
            let summary = context.deliver_now();
            Ok(json!({
                "destinations": summary.destinations,
                "skipped_no_endpoint": summary.skipped_no_endpoint,
                "deferred": summary.deferred,
                "uploads_started": summary.uploads_started,
                "reports_in_flight": summary.reports_in_flight,
            }))
        }
        Command::Gc => {
            let summary = context.collect_garbage();
            Ok(json!({ "reports": summary.reports, "endpoints": summary.endpoints }))
        }
        Command::Persist => Ok(json!({ "persisted": context.persist_now()? })),
        Command::NetworkChanged => {
            let summary = context.on_network_changed();
            Ok(json!({ "reports": summary.reports, "endpoints": summary.endpoints }))
        }
        Command::Clear { origin } => {
            let target = origin.as_deref().map(Origin::parse).transpose()?;
            let summary = context.remove_browsing_data(DataTypes::ALL, |origin| {
                target.as_ref().map_or(true, |target| origin == target)
            });
            Ok(json!({ "reports": summary.reports, "endpoints": summary.endpoints }))
        }
        Command::Status => Ok(status(context)),
    }
}

fn status(context: &ReportingContext) -> Value {
    let pending_uploads = context.pending_uploads();
    context.with_cache(|cache| {
        json!({
            "reports": cache.report_count(),
            "queued": cache.count_with_status(ReportStatus::Queued),
            "in_flight": cache.count_with_status(ReportStatus::InFlight),
            "endpoints": cache.endpoint_count(),
            "pending_uploads": pending_uploads,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reporting_core::{
        Collaborators, InMemoryDelegate, ManualClock, ReportingPolicy, ReportingUploader,
        UploadOutcome,
    };
    use std::sync::Arc;

    struct AcceptAll;

    #[async_trait::async_trait]
    impl ReportingUploader for AcceptAll {
        async fn upload(&self, _url: &Url, _payload: String) -> UploadOutcome {
            UploadOutcome::Success
        }
    }

    fn context() -> ReportingContext {
        let mut collaborators =
            Collaborators::new(Arc::new(AcceptAll), Arc::new(InMemoryDelegate::new()));
        collaborators.clock = Arc::new(ManualClock::default());
        collaborators.rng_seed = 1;
        ReportingContext::new(ReportingPolicy::default(), collaborators)
    }

    #[test]
    fn parse_commands() {
        let command: Command = serde_json::from_str(
            r#"{"cmd":"register","origin":"https://a.example","url":"https://c.example/up"}"#,
        )
        .unwrap();
        assert_eq!(
            command,
            Command::Register {
                origin: "https://a.example".to_string(),
                group: "default".to_string(),
                url: Url::parse("https://c.example/up").unwrap(),
                priority: 1,
                weight: 1,
                max_age_secs: None,
                include_subdomains: false,
            }
        );

        let command: Command = serde_json::from_str(
            r#"{"cmd":"report","url":"https://a.example/p","type":"test"}"#,
        )
        .unwrap();
        assert!(matches!(
            command,
            Command::Report { ref report_type, body: Value::Null, .. } if report_type == "test"
        ));

        let command: Command = serde_json::from_str(r#"{"cmd":"network_changed"}"#).unwrap();
        assert_eq!(command, Command::NetworkChanged);
    }

    #[test]
    fn bad_lines_report_errors() {
        let context = context();
        let response = handle_line(&context, "not json");
        assert_eq!(response["ok"], false);

        let response = handle_line(&context, r#"{"cmd":"launch"}"#);
        assert_eq!(response["ok"], false);

        let response = handle_line(
            &context,
            r#"{"cmd":"register","origin":"not an origin","url":"https://c.example/up"}"#,
        );
        assert_eq!(response["ok"], false);
    }

    #[tokio::test]
    async fn feed_drives_the_context() {
        let context = context();

        let response = handle_line(
            &context,
            r#"{"cmd":"register","origin":"https://a.example","url":"https://c.example/up"}"#,
        );
        assert_eq!(response["ok"], true);

        let response = handle_line(
            &context,
            r#"{"cmd":"report","url":"https://a.example/p","type":"test","body":{"n":1}}"#,
        );
        assert_eq!(response["ok"], true);
        assert!(response["id"].is_string());

        let response = handle_line(&context, r#"{"cmd":"status"}"#);
        assert_eq!(response["queued"], 1);
        assert_eq!(response["endpoints"], 1);

        let response = handle_line(&context, r#"{"cmd":"deliver"}"#);
        assert_eq!(response["uploads_started"], 1);
        context.wait_for_uploads().await;

        let response = handle_line(&context, r#"{"cmd":"status"}"#);
        assert_eq!(response["queued"], 0);
        assert_eq!(response["in_flight"], 0);
        assert_eq!(response["pending_uploads"], 0);

        let response = handle_line(
            &context,
            r#"{"cmd":"unregister","origin":"https://a.example","url":"https://c.example/up"}"#,
        );
        assert_eq!(response["removed"], true);
    }

    #[tokio::test]
    async fn header_and_clear() {
        let context = context();
        let line = json!({
            "cmd": "header",
            "url": "https://a.example/page",
            "value": r#"{"max_age":600,"endpoints":[{"url":"/reports"}]}"#,
        })
        .to_string();
        let response = handle_line(&context, &line);
        assert_eq!(response["groups"], 1);
        assert_eq!(context.with_cache(|cache| cache.endpoint_count()), 1);

        handle_line(
            &context,
            r#"{"cmd":"report","url":"https://b.example/","type":"test"}"#,
        );
        let response = handle_line(&context, r#"{"cmd":"clear","origin":"https://a.example"}"#);
        assert_eq!(response["endpoints"], 1);
        assert_eq!(response["reports"], 0);

        let response = handle_line(&context, r#"{"cmd":"clear"}"#);
        assert_eq!(response["reports"], 1);
    }
}

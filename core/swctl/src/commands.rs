use coachly_sw_protocol::{
    CacheSummary, ClientMessage, Destination, FetchRequest, FetchResponse, HttpMethod, Method,
    QueueEntrySummary, RequestMode, SyncReport,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sw_core::{parse_location, subdomain_redirect, www_redirect, Viewer, ViewerRole};

use crate::daemon_client;
use crate::error::{CliError, Result};

pub struct FetchArgs {
    pub url: String,
    pub method: String,
    pub headers: Vec<String>,
    pub data: Option<String>,
    pub mode: Option<String>,
    pub destination: Option<String>,
    pub credentials: Option<String>,
    pub include_headers: bool,
}

pub fn health() -> Result<()> {
    let data: Value = daemon_client::call(Method::GetHealth, None)?;
    print_json(&data)
}

pub fn fetch(args: FetchArgs) -> Result<()> {
    let request = build_fetch_request(args.url, &args.method, &args.headers, args.data)?;
    let request = FetchRequest {
        mode: match args.mode.as_deref() {
            Some(mode) => parse_enum::<RequestMode>("mode", mode)?,
            None => request.mode,
        },
        destination: match args.destination.as_deref() {
            Some(destination) => parse_enum::<Destination>("destination", destination)?,
            None => request.destination,
        },
        credentials: args.credentials,
        ..request
    };

    let params = serde_json::to_value(&request)
        .map_err(|err| CliError::InvalidArgument(err.to_string()))?;
    let response: FetchResponse = daemon_client::call(Method::Fetch, Some(params))?;

    let source = serde_json::to_value(response.source)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default();
    println!("{} ({})", response.status, source);
    if args.include_headers {
        for (name, value) in &response.headers {
            println!("{}: {}", name, value);
        }
        println!();
    }
    println!("{}", response.body_text());
    Ok(())
}

pub fn sync(tag: Option<String>) -> Result<()> {
    let reports: Vec<SyncReport> = match tag {
        Some(tag) => vec![daemon_client::call(
            Method::Sync,
            Some(serde_json::json!({ "tag": tag })),
        )?],
        None => daemon_client::call(Method::SyncAll, None)?,
    };

    if reports.is_empty() {
        println!("Nothing queued");
    }
    for report in reports {
        match report.error {
            Some(error) => println!("{}  {:?}  {}", report.tag, report.status, error),
            None => println!("{}  {:?}", report.tag, report.status),
        }
    }
    Ok(())
}

pub fn skip_waiting() -> Result<()> {
    let params = serde_json::to_value(ClientMessage::SkipWaiting)
        .map_err(|err| CliError::InvalidArgument(err.to_string()))?;
    let data: Value = daemon_client::call(Method::Message, Some(params))?;
    let changed = data.get("changed").and_then(Value::as_bool).unwrap_or(false);
    let state = data.get("state").and_then(Value::as_str).unwrap_or("unknown");
    if changed {
        println!("Worker activated");
    } else {
        println!("Worker not waiting (state: {})", state);
    }
    Ok(())
}

pub fn listen() -> Result<()> {
    daemon_client::listen(|message| {
        match serde_json::to_string(&message) {
            Ok(line) => println!("{}", line),
            Err(err) => tracing::warn!(error = %err, "Failed to print client message"),
        }
        true
    })
}

pub fn queue() -> Result<()> {
    let entries: Vec<QueueEntrySummary> = daemon_client::call(Method::GetQueue, None)?;
    if entries.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{:<20} {:<6} {} queued={} attempts={}{}",
            entry.tag,
            entry.method.as_str(),
            entry.url,
            entry.queued_at.to_rfc3339(),
            entry.attempts,
            entry
                .last_error
                .map(|err| format!(" last_error={}", err))
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub fn caches() -> Result<()> {
    let caches: Vec<CacheSummary> = daemon_client::call(Method::GetCaches, None)?;
    for cache in caches {
        let bound = match (cache.max_entries, cache.max_age_secs) {
            (Some(entries), Some(age)) => format!("max {} entries, {}s", entries, age),
            (Some(entries), None) => format!("max {} entries", entries),
            (None, Some(age)) => format!("{}s", age),
            (None, None) => "unbounded".to_string(),
        };
        println!("{:<18} {:>5}  {}", cache.name, cache.entries, bound);
    }
    Ok(())
}

pub fn redirect(
    location: &str,
    role: Option<&str>,
    subdomain: Option<String>,
    apex: Option<String>,
) -> Result<()> {
    let url = parse_location(location)?;
    let apex = match apex {
        Some(apex) => apex,
        None => sw_core::load_config(None)
            .map(|config| config.redirect.apex)
            .unwrap_or_else(|_| sw_core::DEFAULT_APEX.to_string()),
    };
    let viewer = match role {
        Some(role) => Some(Viewer {
            role: parse_enum::<ViewerRole>("role", role)?,
            subdomain,
        }),
        None => None,
    };

    match www_redirect(&url).or_else(|| subdomain_redirect(&url, viewer.as_ref(), &apex)) {
        Some(target) => println!("{}", target),
        None => println!("No redirect"),
    }
    Ok(())
}

/// Builds the request skeleton from the raw CLI arguments.
pub fn build_fetch_request(
    url: String,
    method: &str,
    headers: &[String],
    data: Option<String>,
) -> Result<FetchRequest> {
    let method = HttpMethod::parse(method)
        .ok_or_else(|| CliError::InvalidArgument(format!("unknown method {}", method)))?;

    let mut request = FetchRequest::new(method, url);
    for header in headers {
        let (name, value) = parse_header(header)?;
        request = request.with_header(&name, value);
    }
    if let Some(data) = data {
        request = request.with_body(data);
    }
    request
        .validate()
        .map_err(|err| CliError::InvalidArgument(err.message))?;
    Ok(request)
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| CliError::InvalidArgument(format!("header must be name:value, got {}", raw)))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(CliError::InvalidArgument("header name is empty".to_string()));
    }
    Ok((name.to_ascii_lowercase(), value.trim().to_string()))
}

fn parse_enum<T: DeserializeOwned>(what: &str, raw: &str) -> Result<T> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| CliError::InvalidArgument(format!("unknown {} {}", what, raw)))
}

fn print_json(value: &Value) -> Result<()> {
    let pretty = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::BadResponse(err.to_string()))?;
    println!("{}", pretty);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_split_and_lowercased() {
        let (name, value) = parse_header("Content-Type: application/json").expect("header");
        assert_eq!(name, "content-type");
        assert_eq!(value, "application/json");
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn builds_post_with_body() {
        let request = build_fetch_request(
            "https://app.coachly.io/api/notes".to_string(),
            "post",
            &["content-type:application/json".to_string()],
            Some("{}".to_string()),
        )
        .expect("request");
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(
            request.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn rejects_body_on_get() {
        let result = build_fetch_request(
            "https://app.coachly.io/api/notes".to_string(),
            "GET",
            &[],
            Some("{}".to_string()),
        );
        assert!(matches!(result, Err(CliError::InvalidArgument(_))));
    }

    #[test]
    fn enums_parse_from_wire_names() {
        assert_eq!(
            parse_enum::<RequestMode>("mode", "navigate").expect("mode"),
            RequestMode::Navigate
        );
        assert_eq!(
            parse_enum::<Destination>("destination", "script").expect("destination"),
            Destination::Script
        );
        assert!(parse_enum::<ViewerRole>("role", "owner").is_err());
    }
}

//! Process-wide service configuration, loaded once from the environment
//! before the endpoints open and immutable thereafter.

use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;

/// Protocol of a listener or upstream, derived from the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Grpc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Grpc => "grpc",
        }
    }

    /// Derive from a URL. `grpc://` selects gRPC; `https://` TLS HTTP;
    /// anything else, including a bare host, plain HTTP.
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("grpc://") {
            Protocol::Grpc
        } else if url.starts_with("https://") {
            Protocol::Https
        } else {
            Protocol::Http
        }
    }
}

/// One configured upstream dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    pub protocol: Protocol,
    /// Request-path prefixes that activate this upstream; empty means
    /// catch-all.
    pub match_prefixes: Vec<String>,
    /// Path appended when calling the upstream.
    pub path: String,
    /// Mutually-exclusive cohort: exactly one member is called per request.
    pub group: Option<String>,
    /// Inclusion probability for ungrouped upstreams; 0 means always.
    pub probability: f64,
    /// Static weight for intra-group selection.
    pub weight: Option<u32>,
}

impl UpstreamConfig {
    fn new(name: &str, url: &str) -> Self {
        UpstreamConfig {
            name: name.to_string(),
            url: url.to_string(),
            protocol: Protocol::from_url(url),
            match_prefixes: Vec::new(),
            path: "/".to_string(),
            group: None,
            probability: 0.0,
            weight: None,
        }
    }

    /// Full URL for an HTTP call: the configured URL with the configured
    /// path appended.
    pub fn request_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if self.path.starts_with('/') {
            format!("{base}{}", self.path)
        } else {
            format!("{base}/{}", self.path)
        }
    }

    /// Dial target for a gRPC call: scheme stripped, any trailing path
    /// dropped.
    pub fn grpc_authority(&self) -> &str {
        let rest = self.url.strip_prefix("grpc://").unwrap_or(&self.url);
        rest.split('/').next().unwrap_or(rest)
    }
}

const FIELD_KEYWORDS: &[&str] = &["match=", "path=", "group=", "probability=", "weight="];

fn invalid(record: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidUpstream {
        record: record.to_string(),
        reason: reason.into(),
    }
}

fn parse_record(record: &str) -> Result<UpstreamConfig, ConfigError> {
    let (name, rest) = record
        .split_once('=')
        .ok_or_else(|| invalid(record, "expected name=url"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(invalid(record, "empty upstream name"));
    }

    // Split the remainder on ':' but only treat a colon as a delimiter
    // when the token after it starts with a known field keyword. Port
    // digits and scheme separators stay inside the URL; colons inside a
    // field value stay inside that value.
    let mut url = String::new();
    let mut fields: Vec<String> = Vec::new();
    for segment in rest.split(':') {
        let starts_field = FIELD_KEYWORDS.iter().any(|k| segment.starts_with(k));
        if starts_field {
            fields.push(segment.to_string());
        } else if let Some(last) = fields.last_mut() {
            last.push(':');
            last.push_str(segment);
        } else {
            if !url.is_empty() {
                url.push(':');
            }
            url.push_str(segment);
        }
    }
    let url = url.trim();
    if url.is_empty() {
        return Err(invalid(record, "empty upstream url"));
    }

    let mut upstream = UpstreamConfig::new(name, url);
    for field in &fields {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| invalid(record, format!("malformed field {field:?}")))?;
        match key {
            "match" => {
                upstream.match_prefixes = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "path" => upstream.path = value.trim().to_string(),
            "group" => upstream.group = Some(value.trim().to_string()),
            "probability" => {
                let p: f64 = value
                    .trim()
                    .parse()
                    .map_err(|_| invalid(record, format!("invalid probability {value:?}")))?;
                if !(0.0..=1.0).contains(&p) {
                    return Err(invalid(record, format!("probability {p} outside [0,1]")));
                }
                upstream.probability = p;
            }
            "weight" => {
                let w: u32 = value
                    .trim()
                    .parse()
                    .map_err(|_| invalid(record, format!("invalid weight {value:?}")))?;
                upstream.weight = Some(w);
            }
            other => return Err(invalid(record, format!("unknown field {other:?}"))),
        }
    }
    Ok(upstream)
}

/// Parse the pipe-separated `UPSTREAMS` value. Duplicate names are
/// preserved in order: the same endpoint may be fanned out under distinct
/// matches.
pub fn parse_upstreams(raw: &str) -> Result<Vec<UpstreamConfig>, ConfigError> {
    raw.split('|')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(parse_record)
        .collect()
}

/// Immutable process configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    pub namespace: String,
    pub pod: String,
    pub node: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub metrics_port: u16,
    pub upstreams: Vec<UpstreamConfig>,
    pub default_behavior: String,
    pub client_timeout: Duration,
    pub otlp_endpoint: Option<String>,
    pub log_level: String,
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_port(var: &'static str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            var,
            reason: format!("invalid port {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let upstreams = parse_upstreams(&env_or("UPSTREAMS", ""))?;
        let default_behavior = env_or("DEFAULT_BEHAVIOR", "");
        if !default_behavior.is_empty() {
            crate::behavior::parse_chain(&default_behavior).map_err(|e| {
                ConfigError::InvalidEnv {
                    var: "DEFAULT_BEHAVIOR",
                    reason: e.to_string(),
                }
            })?;
        }
        let client_timeout_ms: u64 = {
            let raw = env_or("CLIENT_TIMEOUT_MS", "30000");
            raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: "CLIENT_TIMEOUT_MS",
                reason: format!("invalid timeout {raw:?}"),
            })?
        };
        Ok(ServiceConfig {
            name: env_or("SERVICE_NAME", "testservice"),
            version: env_or("SERVICE_VERSION", "dev"),
            namespace: env_or("NAMESPACE", ""),
            pod: env_or("POD_NAME", ""),
            node: env_or("NODE_NAME", ""),
            http_port: env_port("HTTP_PORT", 8080)?,
            grpc_port: env_port("GRPC_PORT", 9090)?,
            metrics_port: env_port("METRICS_PORT", 9091)?,
            upstreams,
            default_behavior,
            client_timeout: Duration::from_millis(client_timeout_ms),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }

    #[cfg(test)]
    pub fn for_tests(name: &str, upstreams: Vec<UpstreamConfig>) -> Self {
        ServiceConfig {
            name: name.to_string(),
            version: "test".to_string(),
            namespace: "default".to_string(),
            pod: "pod-0".to_string(),
            node: "node-a".to_string(),
            http_port: 0,
            grpc_port: 0,
            metrics_port: 0,
            upstreams,
            default_behavior: String::new(),
            client_timeout: Duration::from_secs(5),
            otlp_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

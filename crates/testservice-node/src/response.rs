//! The structured service response: identical shape over JSON (HTTP) and
//! protobuf (gRPC), with a recursive upstream call tree.

use serde::{Deserialize, Serialize};

use crate::pb;

/// Identity block describing the responding instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: String,
    pub namespace: String,
    pub pod: String,
    pub node: String,
    pub protocol: String,
}

/// Outcome of one outbound call, nested recursively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamCall {
    pub name: String,
    pub uri: String,
    pub protocol: String,
    /// Wall-clock milliseconds around the dispatch.
    pub duration: u64,
    pub code: u16,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub behaviors_applied: Vec<String>,
    #[serde(default)]
    pub upstream_calls: Vec<UpstreamCall>,
}

impl UpstreamCall {
    /// A call failed when it carried an error status or never completed.
    pub fn failed(&self) -> bool {
        self.code >= 300 || !self.error.is_empty()
    }
}

/// Top-level response for one served request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub service: ServiceDescriptor,
    pub url: String,
    /// RFC3339 with nanosecond precision.
    pub start_time: String,
    pub end_time: String,
    /// Wall-clock milliseconds.
    pub duration: u64,
    pub code: u16,
    pub body: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub upstream_calls: Vec<UpstreamCall>,
    #[serde(default)]
    pub behaviors_applied: Vec<String>,
}

fn code_from_wire(code: u32) -> u16 {
    u16::try_from(code).unwrap_or(0)
}

impl From<pb::UpstreamCall> for UpstreamCall {
    fn from(wire: pb::UpstreamCall) -> Self {
        UpstreamCall {
            name: wire.name,
            uri: wire.uri,
            protocol: wire.protocol,
            duration: wire.duration,
            code: code_from_wire(wire.code),
            error: wire.error,
            behaviors_applied: wire.behaviors_applied,
            upstream_calls: wire.upstream_calls.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<UpstreamCall> for pb::UpstreamCall {
    fn from(call: UpstreamCall) -> Self {
        pb::UpstreamCall {
            name: call.name,
            uri: call.uri,
            protocol: call.protocol,
            duration: call.duration,
            code: u32::from(call.code),
            error: call.error,
            behaviors_applied: call.behaviors_applied,
            upstream_calls: call.upstream_calls.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<ServiceResponse> for pb::ServiceResponse {
    fn from(resp: ServiceResponse) -> Self {
        pb::ServiceResponse {
            service: Some(pb::ServiceDescriptor {
                name: resp.service.name,
                version: resp.service.version,
                namespace: resp.service.namespace,
                pod: resp.service.pod,
                node: resp.service.node,
                protocol: resp.service.protocol,
            }),
            url: resp.url,
            start_time: resp.start_time,
            end_time: resp.end_time,
            duration: resp.duration,
            code: u32::from(resp.code),
            body: resp.body,
            trace_id: resp.trace_id,
            span_id: resp.span_id,
            upstream_calls: resp.upstream_calls.into_iter().map(Into::into).collect(),
            behaviors_applied: resp.behaviors_applied,
        }
    }
}

impl From<pb::ServiceResponse> for ServiceResponse {
    fn from(wire: pb::ServiceResponse) -> Self {
        let service = wire.service.unwrap_or_default();
        ServiceResponse {
            service: ServiceDescriptor {
                name: service.name,
                version: service.version,
                namespace: service.namespace,
                pod: service.pod,
                node: service.node,
                protocol: service.protocol,
            },
            url: wire.url,
            start_time: wire.start_time,
            end_time: wire.end_time,
            duration: wire.duration,
            code: code_from_wire(wire.code),
            body: wire.body,
            trace_id: wire.trace_id,
            span_id: wire.span_id,
            upstream_calls: wire.upstream_calls.into_iter().map(Into::into).collect(),
            behaviors_applied: wire.behaviors_applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> ServiceResponse {
        ServiceResponse {
            service: ServiceDescriptor {
                name: "web".to_string(),
                version: "1.0".to_string(),
                namespace: "default".to_string(),
                pod: "web-0".to_string(),
                node: "node-a".to_string(),
                protocol: "http".to_string(),
            },
            url: "/orders/42".to_string(),
            start_time: "2026-01-01T00:00:00.000000000Z".to_string(),
            end_time: "2026-01-01T00:00:00.150000000Z".to_string(),
            duration: 150,
            code: 502,
            body: "Upstream service failure: order-api returned 503".to_string(),
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
            span_id: "00f067aa0ba902b7".to_string(),
            upstream_calls: vec![UpstreamCall {
                name: "order-api".to_string(),
                uri: "http://order-api:8080/".to_string(),
                protocol: "http".to_string(),
                duration: 120,
                code: 503,
                error: String::new(),
                behaviors_applied: vec!["error:503:1.00".to_string()],
                upstream_calls: vec![UpstreamCall {
                    name: "product-api".to_string(),
                    uri: "grpc://product-api:9090".to_string(),
                    protocol: "grpc".to_string(),
                    duration: 15,
                    code: 200,
                    ..Default::default()
                }],
            }],
            behaviors_applied: vec![],
        }
    }

    #[test]
    fn json_uses_snake_case_fields() {
        let json = serde_json::to_value(sample_tree()).unwrap();
        assert!(json.get("start_time").is_some());
        assert!(json.get("trace_id").is_some());
        assert!(json.get("upstream_calls").is_some());
        assert!(json.get("behaviors_applied").is_some());
        let nested = &json["upstream_calls"][0];
        assert_eq!(nested["code"], 503);
        assert_eq!(nested["upstream_calls"][0]["name"], "product-api");
    }

    #[test]
    fn json_round_trips() {
        let resp = sample_tree();
        let json = serde_json::to_string(&resp).unwrap();
        let back: ServiceResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn lenient_deserialization_defaults_missing_arrays() {
        let back: UpstreamCall = serde_json::from_str(
            r#"{"name":"a","uri":"http://a/","protocol":"http","duration":5,"code":200}"#,
        )
        .unwrap();
        assert!(back.upstream_calls.is_empty());
        assert!(back.error.is_empty());
        assert!(!back.failed());
    }

    #[test]
    fn failure_predicate() {
        let mut call = UpstreamCall::default();
        call.code = 200;
        assert!(!call.failed());
        call.code = 302;
        assert!(call.failed());
        call.code = 0;
        call.error = "connection refused".to_string();
        assert!(call.failed());
    }

    #[test]
    fn proto_round_trip_preserves_tree() {
        let resp = sample_tree();
        let wire: pb::ServiceResponse = resp.clone().into();
        let back: ServiceResponse = wire.into();
        assert_eq!(back, resp);
    }
}

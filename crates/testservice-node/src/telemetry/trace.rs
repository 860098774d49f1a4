//! W3C trace-context propagation.
//!
//! HTTP headers and gRPC metadata are two carriers over the same abstract
//! inject/extract API, which is what keeps HTTP→gRPC and gRPC→HTTP hops
//! symmetric: a hop extracts from whichever carrier the request arrived
//! on and injects into whichever carrier the outbound call uses.

use rand::RngCore;

pub const TRACEPARENT: &str = "traceparent";

const VERSION: &str = "00";

/// A propagated trace context: 16-byte trace id and 8-byte span id, both
/// lowercase hex, plus the sampled flag byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub flags: u8,
}

fn rand_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

fn valid_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && s.bytes().any(|b| b != b'0')
}

impl TraceContext {
    /// Fresh root context with the sampled flag set.
    pub fn new_root() -> Self {
        TraceContext {
            trace_id: rand_hex(16),
            span_id: rand_hex(8),
            flags: 0x01,
        }
    }

    /// Child context: same trace, fresh span id.
    pub fn child(&self) -> Self {
        TraceContext {
            trace_id: self.trace_id.clone(),
            span_id: rand_hex(8),
            flags: self.flags,
        }
    }

    /// Parse a `traceparent` header value. Unknown versions and malformed
    /// or all-zero identifiers are rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() && version == VERSION {
            return None;
        }
        if version != VERSION || !valid_hex(trace_id, 32) || !valid_hex(span_id, 16) {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;
        Some(TraceContext {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            flags,
        })
    }

    pub fn to_traceparent(&self) -> String {
        format!(
            "{VERSION}-{}-{}-{:02x}",
            self.trace_id, self.span_id, self.flags
        )
    }
}

/// Abstract propagation carrier. One implementation per wire format.
pub trait Carrier {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
}

impl Carrier for http::HeaderMap {
    fn get(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn set(&mut self, key: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(key.as_bytes()),
            http::header::HeaderValue::from_str(value),
        ) {
            self.insert(name, value);
        }
    }
}

impl Carrier for tonic::metadata::MetadataMap {
    fn get(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn set(&mut self, key: &str, value: &str) {
        if let (Ok(key), Ok(value)) = (
            key.parse::<tonic::metadata::MetadataKey<tonic::metadata::Ascii>>(),
            value.parse::<tonic::metadata::MetadataValue<tonic::metadata::Ascii>>(),
        ) {
            self.insert(key, value);
        }
    }
}

/// Extract the inbound context, or start a new root when the carrier has
/// no usable `traceparent`.
pub fn extract(carrier: &dyn Carrier) -> TraceContext {
    carrier
        .get(TRACEPARENT)
        .and_then(|v| TraceContext::parse(&v))
        .unwrap_or_else(TraceContext::new_root)
}

/// Inject the context into an outbound carrier.
pub fn inject(ctx: &TraceContext, carrier: &mut dyn Carrier) {
    carrier.set(TRACEPARENT, &ctx.to_traceparent());
}

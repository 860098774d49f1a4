//! Prometheus metrics. Registered once into a process-wide registry and
//! exposed in text format on the metrics port.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref REQUESTS_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new("testservice_requests_total", "Requests served, by protocol and status code"),
            &["protocol", "status"],
        )
        .expect("valid metric definition");
        REGISTRY
            .register(Box::new(counter.clone()))
            .expect("register requests_total");
        counter
    };
    pub static ref REQUEST_DURATION: HistogramVec = {
        let histogram = HistogramVec::new(
            HistogramOpts::new(
                "testservice_request_duration_seconds",
                "Wall-clock request duration, by protocol",
            ),
            &["protocol"],
        )
        .expect("valid metric definition");
        REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("register request_duration");
        histogram
    };
    pub static ref UPSTREAM_CALLS_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new(
                "testservice_upstream_calls_total",
                "Outbound upstream calls, by upstream name and outcome",
            ),
            &["upstream", "outcome"],
        )
        .expect("valid metric definition");
        REGISTRY
            .register(Box::new(counter.clone()))
            .expect("register upstream_calls_total");
        counter
    };
    pub static ref BEHAVIORS_APPLIED_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new(
                "testservice_behaviors_applied_total",
                "Behavior phases that actually applied, by directive",
            ),
            &["behavior"],
        )
        .expect("valid metric definition");
        REGISTRY
            .register(Box::new(counter.clone()))
            .expect("register behaviors_applied_total");
        counter
    };
}

pub fn record_request(protocol: &str, status: u16, duration_secs: f64) {
    REQUESTS_TOTAL
        .with_label_values(&[protocol, &status.to_string()])
        .inc();
    REQUEST_DURATION
        .with_label_values(&[protocol])
        .observe(duration_secs);
}

pub fn record_upstream_call(upstream: &str, failed: bool) {
    let outcome = if failed { "failure" } else { "success" };
    UPSTREAM_CALLS_TOTAL
        .with_label_values(&[upstream, outcome])
        .inc();
}

pub fn record_behavior(label: &str) {
    // Count by directive key, not the full label, to keep cardinality low.
    let key = label.split(':').next().unwrap_or(label);
    BEHAVIORS_APPLIED_TOTAL.with_label_values(&[key]).inc();
}

/// Text-format exposition of every registered metric.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_recorded_series() {
        record_request("http", 200, 0.012);
        record_upstream_call("order-api", false);
        record_behavior("latency:fixed:100ms");

        let text = gather();
        assert!(text.contains("testservice_requests_total"));
        assert!(text.contains("testservice_upstream_calls_total"));
        assert!(text.contains("behavior=\"latency\""));
    }
}

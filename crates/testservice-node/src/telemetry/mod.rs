//! Telemetry facade: structured logging, trace-context propagation and
//! Prometheus metrics. Exporter wiring stays outside this process; the
//! configured OTLP endpoint is surfaced so a collector sidecar can be
//! pointed at it.

pub mod metrics;
pub mod trace;

pub use trace::{extract, inject, Carrier, TraceContext, TRACEPARENT};

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. `RUST_LOG` wins over the
/// configured level so operators can raise verbosity per deployment.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

//! Synthetic service node: a single binary that simulates an arbitrary
//! microservice for exercising monitoring, tracing and service-mesh
//! infrastructure under controlled conditions.
//!
//! The node hosts an HTTP and a gRPC endpoint over one request pipeline:
//! it applies declarative fault/pressure behaviors, calls its configured
//! upstreams (sequentially, fail-fast), propagates W3C trace context
//! across protocol boundaries, and answers with the full nested call
//! tree.

pub mod behavior;
pub mod caller;
pub mod config;
pub mod error;
pub mod handler;
pub mod response;
pub mod router;
pub mod server;
pub mod telemetry;

/// Generated protobuf/tonic types for the `testservice` package.
pub mod pb {
    tonic::include_proto!("testservice");
}

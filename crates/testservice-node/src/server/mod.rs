//! Wire endpoints: the HTTP pipeline server, the gRPC service and the
//! Prometheus exposition server. All three are thin adapters over the
//! shared [`RequestHandler`](crate::handler::RequestHandler).

pub mod grpc;
pub mod http;
pub mod metrics;

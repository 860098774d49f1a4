//! Protocol-agnostic upstream caller. Dispatches HTTP or gRPC based on the
//! upstream's URL scheme, injects propagation context into the outbound
//! carrier, and folds whatever comes back into the unified recursive
//! [`UpstreamCall`] record. Failures never propagate as errors: they are
//! recorded in the result and the handler decides what to do.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::{Protocol, UpstreamConfig};
use crate::pb;
use crate::pb::test_service_client::TestServiceClient;
use crate::response::{ServiceResponse, UpstreamCall};
use crate::telemetry::{self, TraceContext};

pub struct UpstreamCaller {
    http: reqwest::Client,
    timeout: Duration,
}

impl UpstreamCaller {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(UpstreamCaller { http, timeout })
    }

    /// Call one upstream, propagating the full behavior chain string. The
    /// returned record always carries the measured wall-clock duration.
    pub async fn call(
        &self,
        upstream: &UpstreamConfig,
        chain: &str,
        parent: &TraceContext,
        cancel: &CancellationToken,
    ) -> UpstreamCall {
        let ctx = parent.child();
        let span = info_span!(
            "upstream.call",
            upstream = %upstream.name,
            trace_id = %ctx.trace_id
        );
        let start = Instant::now();
        let mut result = match upstream.protocol {
            Protocol::Grpc => {
                self.call_grpc(upstream, chain, &ctx, cancel)
                    .instrument(span)
                    .await
            }
            Protocol::Http | Protocol::Https => {
                self.call_http(upstream, chain, &ctx, cancel)
                    .instrument(span)
                    .await
            }
        };
        result.duration = start.elapsed().as_millis() as u64;
        telemetry::metrics::record_upstream_call(&upstream.name, result.failed());
        result
    }

    async fn call_http(
        &self,
        upstream: &UpstreamConfig,
        chain: &str,
        ctx: &TraceContext,
        cancel: &CancellationToken,
    ) -> UpstreamCall {
        let url = upstream.request_url();
        let mut result = UpstreamCall {
            name: upstream.name.clone(),
            uri: url.clone(),
            protocol: upstream.protocol.as_str().to_string(),
            ..Default::default()
        };

        let mut headers = http::HeaderMap::new();
        telemetry::inject(ctx, &mut headers);

        let request = self
            .http
            .get(&url)
            .query(&[("behavior", chain)])
            .headers(headers)
            .send();
        let response = tokio::select! {
            r = request => r,
            _ = cancel.cancelled() => {
                result.error = "request cancelled".to_string();
                return result;
            }
        };

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                match resp.json::<ServiceResponse>().await {
                    Ok(body) => {
                        result.code = body.code;
                        result.behaviors_applied = body.behaviors_applied;
                        result.upstream_calls = body.upstream_calls;
                    }
                    // Not a service node; keep the transport status.
                    Err(_) => result.code = status,
                }
                debug!(upstream = %upstream.name, code = result.code, "http upstream call done");
            }
            Err(e) => {
                warn!(upstream = %upstream.name, error = %e, "http upstream call failed");
                result.code = 0;
                result.error = e.to_string();
            }
        }
        result
    }

    async fn call_grpc(
        &self,
        upstream: &UpstreamConfig,
        chain: &str,
        ctx: &TraceContext,
        cancel: &CancellationToken,
    ) -> UpstreamCall {
        let mut result = UpstreamCall {
            name: upstream.name.clone(),
            uri: upstream.url.clone(),
            protocol: "grpc".to_string(),
            ..Default::default()
        };

        let endpoint = match tonic::transport::Endpoint::from_shared(format!(
            "http://{}",
            upstream.grpc_authority()
        )) {
            Ok(e) => e.timeout(self.timeout).connect_timeout(self.timeout),
            Err(e) => {
                result.code = 500;
                result.error = e.to_string();
                return result;
            }
        };

        let channel = tokio::select! {
            c = endpoint.connect() => match c {
                Ok(c) => c,
                Err(e) => {
                    warn!(upstream = %upstream.name, error = %e, "grpc dial failed");
                    result.code = 500;
                    result.error = e.to_string();
                    return result;
                }
            },
            _ = cancel.cancelled() => {
                result.code = 500;
                result.error = "request cancelled".to_string();
                return result;
            }
        };

        let mut client = TestServiceClient::new(channel);
        let mut request = tonic::Request::new(pb::CallRequest {
            behavior: chain.to_string(),
        });
        telemetry::inject(ctx, request.metadata_mut());

        let response = tokio::select! {
            r = client.call(request) => r,
            _ = cancel.cancelled() => {
                result.code = 500;
                result.error = "request cancelled".to_string();
                return result;
            }
        };

        match response {
            Ok(resp) => {
                let inner = resp.into_inner();
                result.code = u16::try_from(inner.code).unwrap_or(0);
                result.behaviors_applied = inner.behaviors_applied;
                result.upstream_calls = inner.upstream_calls.into_iter().map(Into::into).collect();
                debug!(upstream = %upstream.name, code = result.code, "grpc upstream call done");
            }
            Err(status) => {
                warn!(upstream = %upstream.name, status = %status, "grpc upstream call failed");
                result.code = 500;
                result.error = status.to_string();
            }
        }
        result
    }
}

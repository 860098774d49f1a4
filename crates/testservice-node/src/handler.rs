//! The per-request pipeline, identical across protocols: extract
//! propagation, resolve and execute the behavior, route, call upstreams
//! sequentially with fail-fast, and assemble the recursive response.

use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::behavior::{self, BehaviorChain, ExecutionContext, Outcome};
use crate::caller::UpstreamCaller;
use crate::config::{Protocol, ServiceConfig};
use crate::response::{ServiceDescriptor, ServiceResponse, UpstreamCall};
use crate::router::{self, RouteOutcome};
use crate::telemetry::{metrics, TraceContext};

/// Protocol-independent view of one inbound request.
pub struct InboundRequest {
    /// Request path; drives routing on HTTP. gRPC has no path semantics
    /// and passes the RPC name for logging only.
    pub path: String,
    /// Behavior chain from the request, if any.
    pub behavior: Option<String>,
    pub protocol: Protocol,
    /// Context extracted from the inbound carrier.
    pub trace: TraceContext,
    pub cancel: CancellationToken,
}

pub struct RequestHandler {
    config: Arc<ServiceConfig>,
    caller: UpstreamCaller,
}

impl RequestHandler {
    pub fn new(config: Arc<ServiceConfig>) -> anyhow::Result<Self> {
        let caller = UpstreamCaller::new(config.client_timeout)?;
        Ok(RequestHandler { config, caller })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub async fn handle(&self, req: InboundRequest) -> ServiceResponse {
        let started_at = Utc::now();
        let start = Instant::now();
        // Server span: fresh span id under the propagated (or new) trace.
        let ctx = req.trace.child();
        debug!(
            protocol = req.protocol.as_str(),
            path = %req.path,
            trace_id = %ctx.trace_id,
            "handling request"
        );

        let chain_str = match &req.behavior {
            Some(b) if !b.trim().is_empty() => b.clone(),
            _ => self.config.default_behavior.clone(),
        };

        let (code, body, applied, calls) = self.run_pipeline(&req, &ctx, &chain_str).await;

        for label in &applied {
            metrics::record_behavior(label);
        }
        let elapsed = start.elapsed();
        metrics::record_request(req.protocol.as_str(), code, elapsed.as_secs_f64());
        info!(
            protocol = req.protocol.as_str(),
            path = %req.path,
            code,
            duration_ms = elapsed.as_millis() as u64,
            trace_id = %ctx.trace_id,
            "request served"
        );

        ServiceResponse {
            service: ServiceDescriptor {
                name: self.config.name.clone(),
                version: self.config.version.clone(),
                namespace: self.config.namespace.clone(),
                pod: self.config.pod.clone(),
                node: self.config.node.clone(),
                protocol: req.protocol.as_str().to_string(),
            },
            url: req.path,
            start_time: started_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            end_time: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            duration: elapsed.as_millis() as u64,
            code,
            body,
            trace_id: ctx.trace_id,
            span_id: ctx.span_id,
            upstream_calls: calls,
            behaviors_applied: applied,
        }
    }

    async fn run_pipeline(
        &self,
        req: &InboundRequest,
        ctx: &TraceContext,
        chain_str: &str,
    ) -> (u16, String, Vec<String>, Vec<UpstreamCall>) {
        let chain = match BehaviorChain::parse(chain_str) {
            Ok(chain) => chain,
            Err(e) => {
                return (
                    400,
                    format!("Invalid behavior: {e}"),
                    Vec::new(),
                    Vec::new(),
                )
            }
        };
        let resolved = chain.for_service(&self.config.name);

        let mut applied = Vec::new();
        let exec_ctx = ExecutionContext {
            cancel: &req.cancel,
            trace_id: &ctx.trace_id,
        };
        if let Outcome::EarlyExit { code, body, .. } =
            behavior::execute(&resolved, &exec_ctx, &mut applied).await
        {
            return (code, body, applied, Vec::new());
        }

        // gRPC carries no path: every configured upstream is called. HTTP
        // routes by path prefix.
        let route = match req.protocol {
            Protocol::Grpc => RouteOutcome::Selected((0..self.config.upstreams.len()).collect()),
            Protocol::Http | Protocol::Https => router::select_upstreams(
                &self.config.upstreams,
                &req.path,
                resolved.upstream_weights.as_ref(),
                &mut rand::thread_rng(),
            ),
        };
        let indices = match route {
            RouteOutcome::NoMatch => {
                return (
                    404,
                    format!("No upstream matches path: {}", req.path),
                    applied,
                    Vec::new(),
                )
            }
            RouteOutcome::Selected(indices) => indices,
        };

        let mut calls: Vec<UpstreamCall> = Vec::new();
        let mut failure: Option<(String, u16)> = None;
        for i in indices {
            let upstream = &self.config.upstreams[i];
            let result = self.caller.call(upstream, chain_str, ctx, &req.cancel).await;
            let failed = result.failed();
            if failed {
                failure = Some((result.name.clone(), result.code));
            }
            calls.push(result);
            if failed {
                // Fail fast: remaining upstreams are not dispatched.
                break;
            }
        }

        match failure {
            Some((name, code)) => (
                502,
                format!("Upstream service failure: {name} returned {code}"),
                applied,
                calls,
            ),
            None => (200, "All ok".to_string(), applied, calls),
        }
    }
}

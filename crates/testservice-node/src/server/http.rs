//! HTTP endpoint. Every path feeds the pipeline (the path itself drives
//! routing); `/health` and `/ready` are static and bypass it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Protocol;
use crate::handler::{InboundRequest, RequestHandler};
use crate::response::ServiceResponse;
use crate::telemetry;

const BEHAVIOR_QUERY: &str = "behavior";
const BEHAVIOR_HEADER: &str = "x-behavior";

pub struct HttpServer {
    listener: TcpListener,
    handler: Arc<RequestHandler>,
    shutdown: CancellationToken,
}

impl HttpServer {
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<RequestHandler>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(HttpServer {
            listener,
            handler,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "http endpoint listening");
        loop {
            let (stream, _) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = self.shutdown.cancelled() => {
                    info!("http endpoint shutting down");
                    return Ok(());
                }
            };
            let io = hyper_util::rt::TokioIo::new(stream);
            let handler = self.handler.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    let cancel = shutdown.child_token();
                    async move { Ok::<_, Infallible>(route(handler, req, cancel).await) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %e, "connection error");
                }
            });
        }
    }
}

async fn route(
    handler: Arc<RequestHandler>,
    req: Request<Incoming>,
    cancel: CancellationToken,
) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    match path.as_str() {
        "/health" | "/ready" => text_response(StatusCode::OK, "ok"),
        _ => {
            let behavior = behavior_from_request(&req);
            let trace = telemetry::extract(req.headers());
            let response = handler
                .handle(InboundRequest {
                    path,
                    behavior,
                    protocol: Protocol::Http,
                    trace,
                    cancel,
                })
                .await;
            json_response(&response)
        }
    }
}

/// Behavior string for the request: `?behavior=` first, the `X-Behavior`
/// header as the fallback.
fn behavior_from_request<B>(req: &Request<B>) -> Option<String> {
    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key == BEHAVIOR_QUERY {
                return Some(
                    urlencoding::decode(value)
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| value.to_string()),
                );
            }
        }
    }
    req.headers()
        .get(BEHAVIOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn json_response(response: &ServiceResponse) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(response).unwrap_or_default();
    Response::builder()
        .status(StatusCode::from_u16(response.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn behavior_from_query_param() {
        let req = get("/?behavior=latency%3D100ms");
        assert_eq!(
            behavior_from_request(&req).as_deref(),
            Some("latency=100ms")
        );
    }

    #[test]
    fn behavior_from_unencoded_query() {
        let req = get("/orders?x=1&behavior=latency=100ms,error=0.5");
        assert_eq!(
            behavior_from_request(&req).as_deref(),
            Some("latency=100ms,error=0.5")
        );
    }

    #[test]
    fn behavior_header_is_fallback() {
        let req = Request::builder()
            .uri("/")
            .header("X-Behavior", "error=503")
            .body(())
            .unwrap();
        assert_eq!(behavior_from_request(&req).as_deref(), Some("error=503"));

        // Query wins over the header.
        let req = Request::builder()
            .uri("/?behavior=latency=5ms")
            .header("X-Behavior", "error=503")
            .body(())
            .unwrap();
        assert_eq!(behavior_from_request(&req).as_deref(), Some("latency=5ms"));
    }

    #[test]
    fn no_behavior_anywhere() {
        assert_eq!(behavior_from_request(&get("/?other=1")), None);
        assert_eq!(behavior_from_request(&get("/")), None);
    }

    #[test]
    fn json_response_carries_status() {
        let mut resp = ServiceResponse::default();
        resp.code = 503;
        resp.body = "Injected error: 503".to_string();
        let wire = json_response(&resp);
        assert_eq!(wire.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            wire.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn invalid_status_falls_back_to_500() {
        let mut resp = ServiceResponse::default();
        resp.code = 0;
        let wire = json_response(&resp);
        assert_eq!(wire.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

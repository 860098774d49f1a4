//! Prometheus exposition server on the metrics port.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::telemetry::metrics;

pub struct MetricsServer {
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl MetricsServer {
    pub async fn bind(addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(MetricsServer { listener, shutdown })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "metrics endpoint listening");
        loop {
            let (stream, _) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = self.shutdown.cancelled() => {
                    info!("metrics endpoint shutting down");
                    return Ok(());
                }
            };
            let io = hyper_util::rt::TokioIo::new(stream);
            tokio::spawn(async move {
                let service = service_fn(|req| async move {
                    let response = if req.uri().path() == "/metrics" {
                        Response::builder()
                            .status(StatusCode::OK)
                            .header(hyper::header::CONTENT_TYPE, "text/plain; version=0.0.4")
                            .body(Full::new(Bytes::from(metrics::gather())))
                            .unwrap()
                    } else {
                        Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Full::new(Bytes::from("not found")))
                            .unwrap()
                    };
                    Ok::<_, Infallible>(response)
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %e, "metrics connection error");
                }
            });
        }
    }
}

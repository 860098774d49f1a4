use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use testservice_node::config::ServiceConfig;
use testservice_node::handler::RequestHandler;
use testservice_node::server::http::HttpServer;
use testservice_node::server::metrics::MetricsServer;
use testservice_node::server::grpc;
use testservice_node::telemetry;

#[derive(Parser, Debug)]
#[command(name = "testservice-node")]
#[command(about = "Synthetic service node for monitoring and service-mesh validation")]
struct Args {
    /// Override the HTTP_PORT environment variable.
    #[arg(long)]
    http_port: Option<u16>,
    /// Override the GRPC_PORT environment variable.
    #[arg(long)]
    grpc_port: Option<u16>,
    /// Override the METRICS_PORT environment variable.
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = ServiceConfig::from_env()?;
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(port) = args.grpc_port {
        config.grpc_port = port;
    }
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }

    telemetry::init_logging(&config.log_level);
    info!(
        service = %config.name,
        version = %config.version,
        namespace = %config.namespace,
        upstreams = config.upstreams.len(),
        "starting testservice node"
    );
    if let Some(endpoint) = &config.otlp_endpoint {
        info!(%endpoint, "otlp exporter endpoint configured");
    }

    let config = Arc::new(config);
    let handler = Arc::new(RequestHandler::new(config.clone())?);
    let shutdown = CancellationToken::new();

    let http = HttpServer::bind(
        SocketAddr::from(([0, 0, 0, 0], config.http_port)),
        handler.clone(),
        shutdown.clone(),
    )
    .await?;
    let grpc_listener =
        TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.grpc_port))).await?;
    let metrics = MetricsServer::bind(
        SocketAddr::from(([0, 0, 0, 0], config.metrics_port)),
        shutdown.clone(),
    )
    .await?;

    let servers = [
        tokio::spawn(http.run()),
        tokio::spawn(grpc::serve(grpc_listener, handler, shutdown.clone())),
        tokio::spawn(metrics.run()),
    ];

    shutdown_signal().await;
    info!("shutdown signal received, draining");
    shutdown.cancel();
    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "server exited with error"),
            Err(e) => warn!(error = %e, "server task panicked"),
        }
    }
    info!("clean shutdown");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

//! gRPC endpoint: the single unary `TestService.Call` RPC.
//!
//! Error statuses translate through a fixed table, with one deliberate
//! exception: a 502 (upstream failure) is returned as a normal response so
//! the nested call tree survives on the wire instead of being collapsed
//! into an RPC error.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Protocol;
use crate::handler::{InboundRequest, RequestHandler};
use crate::pb;
use crate::pb::test_service_server::{TestService, TestServiceServer};
use crate::telemetry;

const RPC_PATH: &str = "/testservice.TestService/Call";

pub struct TestServiceGrpc {
    handler: Arc<RequestHandler>,
    shutdown: CancellationToken,
}

impl TestServiceGrpc {
    pub fn new(handler: Arc<RequestHandler>, shutdown: CancellationToken) -> Self {
        TestServiceGrpc { handler, shutdown }
    }
}

#[tonic::async_trait]
impl TestService for TestServiceGrpc {
    async fn call(
        &self,
        request: Request<pb::CallRequest>,
    ) -> Result<Response<pb::ServiceResponse>, Status> {
        let trace = telemetry::extract(request.metadata());
        let behavior = {
            let b = request.into_inner().behavior;
            (!b.is_empty()).then_some(b)
        };
        let response = self
            .handler
            .handle(InboundRequest {
                path: RPC_PATH.to_string(),
                behavior,
                protocol: Protocol::Grpc,
                trace,
                cancel: self.shutdown.child_token(),
            })
            .await;

        if response.code >= 300 && response.code != 502 {
            return Err(Status::new(grpc_code(response.code), response.body));
        }
        Ok(Response::new(response.into()))
    }
}

/// Fixed HTTP-status to gRPC-code translation.
pub fn grpc_code(code: u16) -> Code {
    match code {
        400 => Code::InvalidArgument,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::NotFound,
        409 => Code::AlreadyExists,
        429 => Code::ResourceExhausted,
        499 => Code::Cancelled,
        500 => Code::Internal,
        501 => Code::Unimplemented,
        503 => Code::Unavailable,
        504 => Code::DeadlineExceeded,
        _ => Code::Unknown,
    }
}

/// Serve the gRPC endpoint on an already-bound listener until shutdown.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<RequestHandler>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "grpc endpoint listening");
    let service = TestServiceServer::new(TestServiceGrpc::new(handler, shutdown.clone()));
    Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            shutdown.cancelled_owned(),
        )
        .await?;
    info!("grpc endpoint shut down");
    Ok(())
}

//! End-to-end pipeline tests: real nodes on ephemeral ports, chained over
//! HTTP and gRPC.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use testservice_node::config::{parse_upstreams, ServiceConfig};
use testservice_node::handler::RequestHandler;
use testservice_node::pb;
use testservice_node::pb::test_service_client::TestServiceClient;
use testservice_node::response::ServiceResponse;
use testservice_node::server::grpc;
use testservice_node::server::http::HttpServer;

struct Node {
    http: SocketAddr,
    grpc: SocketAddr,
    #[allow(dead_code)]
    shutdown: CancellationToken,
}

async fn start_node(name: &str, upstreams: &str, default_behavior: &str) -> Node {
    let config = ServiceConfig {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        namespace: "default".to_string(),
        pod: format!("{name}-0"),
        node: "node-a".to_string(),
        http_port: 0,
        grpc_port: 0,
        metrics_port: 0,
        upstreams: parse_upstreams(upstreams).unwrap(),
        default_behavior: default_behavior.to_string(),
        client_timeout: Duration::from_secs(5),
        otlp_endpoint: None,
        log_level: "info".to_string(),
    };
    let handler = Arc::new(RequestHandler::new(Arc::new(config)).unwrap());
    let shutdown = CancellationToken::new();

    let http = HttpServer::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        handler.clone(),
        shutdown.clone(),
    )
    .await
    .unwrap();
    let http_addr = http.local_addr().unwrap();
    let grpc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let grpc_addr = grpc_listener.local_addr().unwrap();

    tokio::spawn(http.run());
    tokio::spawn(grpc::serve(grpc_listener, handler, shutdown.clone()));

    Node {
        http: http_addr,
        grpc: grpc_addr,
        shutdown,
    }
}

async fn get(addr: SocketAddr, path_and_query: &str) -> (u16, ServiceResponse) {
    let url = format!("http://{addr}{path_and_query}");
    let resp = reqwest::get(&url).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn leaf_fixed_latency() {
    let node = start_node("web", "", "").await;
    let (status, body) = get(node.http, "/?behavior=latency=100ms").await;
    assert_eq!(status, 200);
    assert_eq!(body.code, 200);
    assert_eq!(body.body, "All ok");
    assert!(body.duration >= 100, "duration was {}", body.duration);
    assert!(body
        .behaviors_applied
        .contains(&"latency:fixed:100ms".to_string()));
    assert!(body.upstream_calls.is_empty());
    assert_eq!(body.service.name, "web");
}

#[tokio::test]
async fn targeted_error_down_a_mixed_protocol_chain() {
    // web --HTTP--> order-api --gRPC--> product-api
    let product = start_node("product-api", "", "").await;
    let order = start_node(
        "order-api",
        &format!("product-api=grpc://127.0.0.1:{}", product.grpc.port()),
        "",
    )
    .await;
    let web = start_node(
        "web",
        &format!("order-api=http://127.0.0.1:{}", order.http.port()),
        "",
    )
    .await;

    // Sanity: with no behavior the whole chain is healthy and the tree is
    // two levels deep.
    let (status, body) = get(web.http, "/?behavior=").await;
    assert_eq!(status, 200);
    assert_eq!(body.upstream_calls.len(), 1);
    assert_eq!(body.upstream_calls[0].name, "order-api");
    assert_eq!(body.upstream_calls[0].upstream_calls.len(), 1);
    assert_eq!(body.upstream_calls[0].upstream_calls[0].name, "product-api");
    assert_eq!(body.upstream_calls[0].upstream_calls[0].protocol, "grpc");

    // Target the middle hop: only order-api injects the error, and it
    // early-exits before calling product-api.
    let (status, body) = get(web.http, "/?behavior=order-api:error=503:1.0").await;
    assert_eq!(status, 502);
    assert_eq!(body.code, 502);
    assert_eq!(body.body, "Upstream service failure: order-api returned 503");
    let nested = &body.upstream_calls[0];
    assert_eq!(nested.code, 503);
    assert!(nested
        .behaviors_applied
        .contains(&"error:503:1.00".to_string()));
    assert!(nested.upstream_calls.is_empty());
}

#[tokio::test]
async fn path_based_routing() {
    let a = start_node("a", "", "").await;
    let b = start_node("b", "", "").await;
    let web = start_node(
        "web",
        &format!(
            "a=http://127.0.0.1:{}:match=/orders|b=http://127.0.0.1:{}:match=/products",
            a.http.port(),
            b.http.port()
        ),
        "",
    )
    .await;

    let (status, body) = get(web.http, "/orders/42").await;
    assert_eq!(status, 200);
    assert_eq!(body.upstream_calls.len(), 1);
    assert_eq!(body.upstream_calls[0].name, "a");

    let (status, body) = get(web.http, "/unknown").await;
    assert_eq!(status, 404);
    assert_eq!(body.body, "No upstream matches path: /unknown");
    assert!(body.upstream_calls.is_empty());
}

#[tokio::test]
async fn behavior_header_fallback() {
    let node = start_node("web", "", "").await;
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/", node.http))
        .header("X-Behavior", "error=503")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);
    let body: ServiceResponse = resp.json().await.unwrap();
    assert_eq!(body.body, "Injected error: 503");
}

#[tokio::test]
async fn health_and_ready_bypass_the_pipeline() {
    // Even a node whose default behavior always fails stays live/ready.
    let node = start_node("web", "", "error=503:1.0").await;
    for path in ["/health", "/ready"] {
        let resp = reqwest::get(format!("http://{}{path}", node.http))
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
    }
    let (status, _) = get(node.http, "/").await;
    assert_eq!(status, 503);
}

#[tokio::test]
async fn traceparent_is_honored_on_http() {
    let node = start_node("web", "", "").await;
    let client = reqwest::Client::new();
    let resp: ServiceResponse = client
        .get(format!("http://{}/", node.http))
        .header(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
    assert_ne!(resp.span_id, "00f067aa0ba902b7");
}

#[tokio::test]
async fn traceparent_is_honored_on_grpc() {
    let node = start_node("web", "", "").await;
    let mut client = TestServiceClient::connect(format!("http://{}", node.grpc))
        .await
        .unwrap();
    let mut request = tonic::Request::new(pb::CallRequest {
        behavior: String::new(),
    });
    request.metadata_mut().insert(
        "traceparent",
        "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
            .parse()
            .unwrap(),
    );
    let response = client.call(request).await.unwrap().into_inner();
    assert_eq!(response.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
    assert_eq!(response.code, 200);
    assert_eq!(response.body, "All ok");
}

#[tokio::test]
async fn grpc_error_injection_maps_to_status() {
    let node = start_node("web", "", "").await;
    let mut client = TestServiceClient::connect(format!("http://{}", node.grpc))
        .await
        .unwrap();
    let err = client
        .call(pb::CallRequest {
            behavior: "error=404:1.0".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);
    assert_eq!(err.message(), "Injected error: 404");
}

#[tokio::test]
async fn grpc_returns_502_without_rpc_error() {
    // Upstream failure must come back as a normal response so the call
    // tree survives.
    let node = start_node("web", "dead=http://127.0.0.1:9", "").await;
    let mut client = TestServiceClient::connect(format!("http://{}", node.grpc))
        .await
        .unwrap();
    let response = client
        .call(pb::CallRequest {
            behavior: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.code, 502);
    assert_eq!(response.upstream_calls.len(), 1);
    assert!(!response.upstream_calls[0].error.is_empty());
}

#[tokio::test]
async fn grpc_to_http_hop_propagates_behavior() {
    // grpc entrypoint -> HTTP leaf, targeted error on the leaf.
    let leaf = start_node("leaf", "", "").await;
    let entry = start_node(
        "entry",
        &format!("leaf=http://127.0.0.1:{}", leaf.http.port()),
        "",
    )
    .await;
    let mut client = TestServiceClient::connect(format!("http://{}", entry.grpc))
        .await
        .unwrap();
    let response = client
        .call(pb::CallRequest {
            behavior: "leaf:error=503:1.0".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.code, 502);
    assert_eq!(response.upstream_calls[0].code, 503);
}

#[tokio::test]
async fn range_latency_distribution() {
    let node = start_node("web", "", "").await;
    let client = reqwest::Client::new();
    let mut total_ms = 0u64;
    const N: u64 = 30;
    for _ in 0..N {
        let resp: ServiceResponse = client
            .get(format!("http://{}/?behavior=latency=50-100ms", node.http))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(
            (50..=150).contains(&resp.duration),
            "duration {} out of range",
            resp.duration
        );
        total_ms += resp.duration;
    }
    let mean = total_ms / N;
    assert!((55..=100).contains(&mean), "mean duration {mean}");
}

#[tokio::test]
async fn disk_fill_applies_and_reports_failure() {
    let node = start_node("web", "", "").await;
    let dir = tempfile::tempdir().unwrap();

    let (status, body) = get(
        node.http,
        &format!("/?behavior=disk=fill:4Ki:{}:1s", dir.path().display()),
    )
    .await;
    assert_eq!(status, 200);
    assert!(body
        .behaviors_applied
        .iter()
        .any(|b| b.starts_with("disk:fill:4Ki:")));

    let (status, body) = get(
        node.http,
        "/?behavior=disk=fill:4Ki:/nonexistent-fill-target:1s",
    )
    .await;
    assert_eq!(status, 507);
    assert!(body.body.starts_with("Disk fill failed"), "{}", body.body);
}

#[tokio::test]
async fn request_weights_steer_group_selection() {
    let a = start_node("a", "", "").await;
    let b = start_node("b", "", "").await;
    let web = start_node(
        "web",
        &format!(
            "a=http://127.0.0.1:{}:group=backend|b=http://127.0.0.1:{}:group=backend",
            a.http.port(),
            b.http.port()
        ),
        "",
    )
    .await;

    // All weight on b: the group must always pick it.
    for _ in 0..20 {
        let (status, body) = get(web.http, "/?behavior=upstreamWeights=a:0;b:100").await;
        assert_eq!(status, 200);
        assert_eq!(body.upstream_calls.len(), 1);
        assert_eq!(body.upstream_calls[0].name, "b");
    }
}

#[tokio::test]
async fn metrics_endpoint_exposes_counters() {
    use testservice_node::server::metrics::MetricsServer;

    let node = start_node("web", "", "").await;
    let shutdown = CancellationToken::new();
    let metrics = MetricsServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), shutdown.clone())
        .await
        .unwrap();
    let metrics_addr = metrics.local_addr().unwrap();
    tokio::spawn(metrics.run());

    let (status, _) = get(node.http, "/?behavior=latency=1ms").await;
    assert_eq!(status, 200);

    let text = reqwest::get(format!("http://{metrics_addr}/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("testservice_requests_total"));
    assert!(text.contains("testservice_request_duration_seconds"));

    let resp = reqwest::get(format!("http://{metrics_addr}/other"))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn upstream_durations_nest_within_parent() {
    let leaf = start_node("leaf", "", "").await;
    let web = start_node(
        "web",
        &format!("leaf=http://127.0.0.1:{}", leaf.http.port()),
        "",
    )
    .await;
    let (_, body) = get(web.http, "/?behavior=leaf:latency=50ms").await;
    assert_eq!(body.code, 200);
    let upstream = &body.upstream_calls[0];
    assert!(upstream.duration >= 50);
    assert!(
        body.duration >= upstream.duration,
        "parent {} < child {}",
        body.duration,
        upstream.duration
    );
}

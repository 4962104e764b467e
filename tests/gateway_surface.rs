//! Gateway HTTP surface tests.
//!
//! Drives the gateway router with `tower::ServiceExt::oneshot` against a
//! cluster client backed by a [`MemoryRegistry`], checking the error
//! mapping (400 malformed, 404 absent, 500 remote failure, 503 no known
//! node) and the JSON-or-raw write path against one real node.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use meshcache::client::ClusterClient;
use meshcache::gateway;
use meshcache::group::{GroupDirectory, MapSource};
use meshcache::registry::{MemoryRegistry, ServiceRegistry};
use meshcache::ring::RingConfig;
use meshcache::rpc;
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceExt;

const SERVICE: &str = "meshcache-gw-test";

async fn client_for(registry: &MemoryRegistry) -> Arc<ClusterClient> {
    ClusterClient::new(SERVICE, Arc::new(registry.handle()), RingConfig::default())
        .await
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// One RPC-serving node registered under `SERVICE`.
async fn start_backing_node(registry: &MemoryRegistry) -> (MemoryRegistry, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let directory = Arc::new(GroupDirectory::new());
    directory
        .create_group(
            "scores",
            1 << 20,
            Arc::new(MapSource::new([("Tom", "400")])),
        )
        .unwrap();

    let app = rpc::router(directory);
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let handle = registry.handle();
    handle.register(SERVICE, &addr).await.unwrap();
    (handle, server)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_cluster_maps_to_service_unavailable() {
    let registry = MemoryRegistry::new();
    let client = client_for(&registry).await;
    let app = gateway::router(client.clone());

    let response = app
        .oneshot(
            Request::get("/api/cache/scores/Tom")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], 503);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_value_maps_to_bad_request() {
    let registry = MemoryRegistry::new();
    let client = client_for(&registry).await;
    let app = gateway::router(client.clone());

    let response = app
        .oneshot(
            Request::post("/api/cache/scores/Tom")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_node_maps_to_internal_error() {
    let registry = MemoryRegistry::new();
    // A registration nothing listens behind.
    let dead = registry.handle();
    dead.register(SERVICE, "127.0.0.1:1").await.unwrap();

    let client = client_for(&registry).await;
    let app = gateway::router(client.clone());

    let response = app
        .oneshot(
            Request::get("/api/cache/scores/Tom")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn round_trip_through_one_node() {
    let registry = MemoryRegistry::new();
    let (_node_registry, server) = start_backing_node(&registry).await;
    let client = client_for(&registry).await;
    let app = gateway::router(client.clone());

    // Source-backed read.
    let response = app
        .clone()
        .oneshot(
            Request::get("/api/cache/scores/Tom")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["value"], "400");

    // JSON write body.
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/cache/scores/Alice")
                .body(Body::from(r#"{"value": "320"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["success"], true);

    // Raw write body.
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/cache/scores/Bob")
                .body(Body::from("280"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    for (key, want) in [("Alice", "320"), ("Bob", "280")] {
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/cache/scores/{key}").as_str())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["value"], want);
    }

    // Absent key.
    let response = app
        .clone()
        .oneshot(
            Request::get("/api/cache/scores/Unknown")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Delete; nothing backs the key afterwards, so reads miss.
    let response = app
        .clone()
        .oneshot(
            Request::delete("/api/cache/scores/Alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["deleted"], true);

    let response = app
        .oneshot(
            Request::get("/api/cache/scores/Alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    client.shutdown().await;
    server.abort();
}

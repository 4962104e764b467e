//! Peer RPC surface tests.
//!
//! Drives the RPC router directly with `tower::ServiceExt::oneshot`,
//! covering the NOT_FOUND mappings, the gateway-header origin flag, and
//! the invalidate handler's receiver-side semantics.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use meshcache::group::{GroupDirectory, MapSource};
use meshcache::rpc;
use meshcache::ByteView;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

fn directory_with_scores() -> (Arc<GroupDirectory>, meshcache::CacheGroup) {
    let directory = Arc::new(GroupDirectory::new());
    let group = directory
        .create_group(
            "scores",
            1 << 20,
            Arc::new(MapSource::new([("Tom", "400"), ("Kerolt", "370")])),
        )
        .unwrap();
    (directory, group)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_healthy() {
    let (directory, _group) = directory_with_scores();
    let app = rpc::router(directory);

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn get_on_unknown_group_is_not_found() {
    let (directory, _group) = directory_with_scores();
    let app = rpc::router(directory);

    let response = app
        .oneshot(
            Request::get("/rpc/groups/nope/entry?key=Tom")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_returns_source_backed_value() {
    let (directory, _group) = directory_with_scores();
    let app = rpc::router(directory);

    let response = app
        .oneshot(
            Request::get("/rpc/groups/scores/entry?key=Tom")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "400");
}

#[tokio::test]
async fn get_on_absent_key_is_not_found() {
    let (directory, _group) = directory_with_scores();
    let app = rpc::router(directory);

    let response = app
        .oneshot(
            Request::get("/rpc/groups/scores/entry?key=Unknown")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn put_stores_the_body_locally() {
    let (directory, group) = directory_with_scores();
    let app = rpc::router(directory);

    let response = app
        .clone()
        .oneshot(
            Request::put("/rpc/groups/scores/entry?key=Alice")
                .body(Body::from("320"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);

    assert_eq!(group.peek_local("Alice"), Some(ByteView::from("320")));

    let response = app
        .oneshot(
            Request::get("/rpc/groups/scores/entry?key=Alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_string(response).await, "320");
}

#[tokio::test]
async fn put_with_gateway_header_still_succeeds_without_peers() {
    // With no peer picker registered, a gateway-originated write is just a
    // local write; the origin flag must not change the outcome.
    let (directory, group) = directory_with_scores();
    let app = rpc::router(directory);

    let response = app
        .oneshot(
            Request::put("/rpc/groups/scores/entry?key=Bob")
                .header(rpc::GATEWAY_HEADER, "true")
                .body(Body::from("280"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["success"], true);
    assert_eq!(group.peek_local("Bob"), Some(ByteView::from("280")));
}

#[tokio::test]
async fn put_on_closed_group_reports_failure() {
    let (directory, group) = directory_with_scores();
    group.close();
    let app = rpc::router(directory);

    let response = app
        .oneshot(
            Request::put("/rpc/groups/scores/entry?key=Tom")
                .body(Body::from("0"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["success"], false);
}

#[tokio::test]
async fn delete_removes_the_local_copy() {
    let (directory, group) = directory_with_scores();
    let app = rpc::router(directory);

    // Prime the local store, then delete over RPC.
    assert!(group.set("Tom", ByteView::from("400"), true).await);
    let response = app
        .oneshot(
            Request::delete("/rpc/groups/scores/entry?key=Tom")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["success"], true);
    assert_eq!(group.peek_local("Tom"), None);
}

#[tokio::test]
async fn invalidate_drops_local_copy_only() {
    let (directory, group) = directory_with_scores();
    let app = rpc::router(directory);

    assert!(group.set("Kerolt", ByteView::from("370"), true).await);
    let response = app
        .oneshot(
            Request::post("/rpc/groups/scores/invalidate?key=Kerolt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["success"], true);
    assert_eq!(group.peek_local("Kerolt"), None);
}

#[tokio::test]
async fn stats_endpoint_lists_groups() {
    let (directory, group) = directory_with_scores();
    let app = rpc::router(directory);

    group.get("Tom").await;
    group.get("Tom").await;

    let response = app
        .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["scores"]["local_misses"], 1);
    assert!(json["scores"]["local_hits"].as_i64().unwrap() >= 1);
}

#[tokio::test]
async fn metrics_endpoint_renders_prometheus_text() {
    let (directory, group) = directory_with_scores();
    let app = rpc::router(directory);

    group.get("Tom").await;
    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = body_string(response).await;
    assert!(text.contains("meshcache_lookups_total"));
}

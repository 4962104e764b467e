//! Peer RPC surface.
//!
//! Four unary operations on cache groups, served over HTTP. Peers call
//! these without any marker; the gateway (or any external originator)
//! adds the `x-meshcache-gateway: true` header, which makes the receiving
//! node treat the write as its own and propagate it. Peer-originated
//! writes are applied locally only; that asymmetry is what breaks write
//! cycles between nodes.

use crate::group::GroupDirectory;
use crate::metrics;
use crate::types::ByteView;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Header marking an externally originated write.
pub const GATEWAY_HEADER: &str = "x-meshcache-gateway";

#[derive(Debug, Deserialize)]
struct KeyQuery {
    key: String,
}

#[derive(Debug, Serialize)]
struct AckResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Shared state for the RPC handlers.
#[derive(Clone)]
pub struct RpcState {
    directory: Arc<GroupDirectory>,
}

/// Build the RPC router over a group directory.
///
/// The directory (and peer discovery) must be fully initialized before
/// this router starts accepting requests; early requests against an empty
/// ring fall through to the data source unnecessarily.
pub fn router(directory: Arc<GroupDirectory>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/stats", get(stats))
        .route(
            "/rpc/groups/:group/entry",
            get(get_entry).put(set_entry).delete(delete_entry),
        )
        .route("/rpc/groups/:group/invalidate", post(invalidate_entry))
        .with_state(RpcState { directory })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics_text() -> String {
    metrics::gather()
}

async fn stats(State(state): State<RpcState>) -> impl IntoResponse {
    let mut stats = HashMap::new();
    for name in state.directory.group_names() {
        if let Some(group) = state.directory.get_group(&name) {
            stats.insert(name, group.stats());
        }
    }
    Json(stats)
}

async fn get_entry(
    State(state): State<RpcState>,
    Path(group_name): Path<String>,
    Query(query): Query<KeyQuery>,
) -> Response {
    let Some(group) = state.directory.get_group(&group_name) else {
        return (StatusCode::NOT_FOUND, "group not found").into_response();
    };
    match group.get(&query.key).await {
        Some(value) => value.to_vec().into_response(),
        None => (StatusCode::NOT_FOUND, "key not found").into_response(),
    }
}

async fn set_entry(
    State(state): State<RpcState>,
    Path(group_name): Path<String>,
    Query(query): Query<KeyQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(group) = state.directory.get_group(&group_name) else {
        return (StatusCode::NOT_FOUND, "group not found").into_response();
    };
    let from_peer = !headers.contains_key(GATEWAY_HEADER);
    let success = group
        .set(&query.key, ByteView::from(body), from_peer)
        .await;
    Json(AckResponse { success }).into_response()
}

async fn delete_entry(
    State(state): State<RpcState>,
    Path(group_name): Path<String>,
    Query(query): Query<KeyQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(group) = state.directory.get_group(&group_name) else {
        return (StatusCode::NOT_FOUND, "group not found").into_response();
    };
    let from_peer = !headers.contains_key(GATEWAY_HEADER);
    let success = group.delete(&query.key, from_peer).await;
    Json(AckResponse { success }).into_response()
}

async fn invalidate_entry(
    State(state): State<RpcState>,
    Path(group_name): Path<String>,
    Query(query): Query<KeyQuery>,
) -> Response {
    let Some(group) = state.directory.get_group(&group_name) else {
        return (StatusCode::NOT_FOUND, "group not found").into_response();
    };
    // Peer-to-peer only: drop the local copy, never propagate further.
    let success = group.invalidate_from_peer(&query.key);
    Json(AckResponse { success }).into_response()
}

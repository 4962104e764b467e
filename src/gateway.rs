//! HTTP gateway.
//!
//! External-facing facade over the cluster: `GET/POST/DELETE
//! /api/cache/{group}/{key}`. The POST body is either JSON
//! `{"value": ...}` or raw bytes. The gateway itself caches nothing; every
//! request is routed to the key's owning node through a
//! [`ClusterClient`].
//!
//! Error mapping: 400 malformed request, 404 absent, 500 remote failure,
//! 503 no known node.

use crate::client::{ClientError, ClusterClient};
use crate::types::ByteView;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

/// Build the gateway router over a cluster client.
pub fn router(client: Arc<ClusterClient>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/cache/:group/:key",
            get(get_value).post(set_value).delete(delete_value),
        )
        .with_state(client)
        .layer(cors)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": message, "code": status.as_u16() })),
    )
        .into_response()
}

fn map_client_error(err: ClientError) -> Response {
    match err {
        ClientError::NoPeer => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "no cache node available")
        }
        ClientError::Remote(msg) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &msg)
        }
    }
}

async fn get_value(
    State(client): State<Arc<ClusterClient>>,
    Path((group, key)): Path<(String, String)>,
) -> Response {
    match client.get(&group, &key).await {
        Ok(Some(value)) => Json(json!({
            "group": group,
            "key": key,
            "value": value.to_string(),
        }))
        .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "key not found"),
        Err(e) => map_client_error(e),
    }
}

async fn set_value(
    State(client): State<Arc<ClusterClient>>,
    Path((group, key)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    // JSON {"value": ...} when it parses; raw bytes otherwise.
    let value = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => match map.get("value") {
            Some(Value::String(s)) => ByteView::from(s.as_str()),
            Some(other) => ByteView::from(other.to_string()),
            None => ByteView::from(body.as_ref()),
        },
        _ => ByteView::from(body.as_ref()),
    };

    if value.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "value is required");
    }

    debug!(group, key, "Gateway write");
    match client.set(&group, &key, value.clone()).await {
        Ok(true) => Json(json!({
            "group": group,
            "key": key,
            "value": value.to_string(),
            "success": true,
        }))
        .into_response(),
        Ok(false) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "write rejected"),
        Err(e) => map_client_error(e),
    }
}

async fn delete_value(
    State(client): State<Arc<ClusterClient>>,
    Path((group, key)): Path<(String, String)>,
) -> Response {
    match client.delete(&group, &key).await {
        Ok(true) => Json(json!({
            "group": group,
            "key": key,
            "deleted": true,
        }))
        .into_response(),
        Ok(false) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "delete rejected"),
        Err(e) => map_client_error(e),
    }
}

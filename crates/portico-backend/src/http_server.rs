//! JSON-RPC HTTP surface of a backend node.
//!
//! All RPC traffic arrives as POST `/`. Transport-level success is always
//! HTTP 200; RPC failures travel in the JSON-RPC `error` member, which is
//! what keeps a misbehaving request from counting against the node's
//! transport health at the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use portico_common::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, PorticoError};
use portico_metrics::{MetricsRegistry, ServerInfo, ServerRole};

use crate::service::BackendService;

struct NodeState {
    service: Arc<dyn BackendService>,
    metrics: Arc<MetricsRegistry>,
}

/// Builds the node's axum application.
pub fn build_app(service: Arc<dyn BackendService>, metrics: Arc<MetricsRegistry>) -> Router {
    let state = Arc::new(NodeState { service, metrics });

    let rpc_state = Arc::clone(&state);
    let mut app = Router::new().route(
        "/",
        post(move |body: Bytes| {
            let state = Arc::clone(&rpc_state);
            async move { handle_rpc(state, body).await }
        }),
    );

    app = app.route("/__health", get(|| async { Json(json!({"status": "ok"})) }));

    let info_state = Arc::clone(&state);
    app = app.route(
        "/__info",
        get(move || {
            let state = Arc::clone(&info_state);
            async move {
                Json(ServerInfo::new(
                    ServerRole::Backend,
                    state.metrics.uptime_ms(),
                ))
            }
        }),
    );

    let metrics_state = Arc::clone(&state);
    app.route(
        "/__metrics",
        get(move || {
            let state = Arc::clone(&metrics_state);
            async move { Json(state.metrics.snapshot()) }
        }),
    )
}

async fn handle_rpc(state: Arc<NodeState>, body: Bytes) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => {
            let response = JsonRpcResponse::failure(Value::Null, JsonRpcError::parse_error());
            return (StatusCode::OK, Json(response)).into_response();
        }
    };

    let started = Instant::now();
    debug!(method = %request.method, "rpc call");
    let result = state.service.call(&request.method, request.params).await;
    let latency_us = started.elapsed().as_micros() as u64;
    state
        .metrics
        .record_call(&request.method, latency_us, result.is_ok());

    let response = match result {
        Ok(value) => JsonRpcResponse::success(request.id, value),
        Err(PorticoError::MethodNotFound(method)) => JsonRpcResponse::failure(
            request.id,
            JsonRpcError::method_not_found(&method),
        ),
        Err(PorticoError::InvalidRequest(msg)) => {
            JsonRpcResponse::failure(request.id, JsonRpcError::invalid_request(&msg))
        }
        Err(e) => JsonRpcResponse::failure(request.id, JsonRpcError::server_error(&e.to_string())),
    };
    (StatusCode::OK, Json(response)).into_response()
}

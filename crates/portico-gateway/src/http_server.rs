//! Gateway HTTP listener.
//!
//! One axum route per routing-table entry, plus the `__health`, `__metrics`
//! and `__info` built-ins. The pipeline is driven by the handler future, so
//! a client disconnect aborts the in-flight backend call; the pipeline's own
//! guard then finalizes the request (dedup claim released, log entry and
//! metrics emitted) from a detached task.

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::info;

use portico_common::protocol::{PorticoError, Result};
use portico_metrics::{MetricsRegistry, ServerInfo, ServerRole};
use portico_registry::{CoordinationStore, EndpointRegistry, RegistryConfig};

use crate::clock::SystemClock;
use crate::context::RequestContext;
use crate::dedup::MemoryDedupStore;
use crate::idempotency::IdempotencyStage;
use crate::observability::{ObservabilityStage, TracingSink};
use crate::pipeline::{Outcome, Pipeline, PipelineBuilder};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::router::{GatewayRouter, RoutingTable};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// Service name whose backends this gateway fronts.
    pub service: String,
    pub routes: RoutingTable,
    /// Header carrying the client's idempotency key.
    pub request_id_header: String,
    /// Header whose value overrides the socket peer address in logs.
    pub real_ip_header: String,
    /// How long a completed request ID keeps rejecting duplicates.
    pub retention: Duration,
    pub pool: PoolConfig,
    pub idempotency_excluded_paths: Vec<String>,
    pub observability_excluded_paths: Vec<String>,
}

impl GatewayConfig {
    pub fn new(listen_addr: SocketAddr, service: impl Into<String>) -> Self {
        Self {
            listen_addr,
            service: service.into(),
            routes: RoutingTable::new(),
            request_id_header: "x-request-id".to_string(),
            real_ip_header: "x-real-ip".to_string(),
            retention: Duration::from_secs(300),
            pool: PoolConfig::default(),
            idempotency_excluded_paths: Vec::new(),
            observability_excluded_paths: Vec::new(),
        }
    }
}

struct GatewayState {
    pipeline: Pipeline,
    router: GatewayRouter,
    metrics: Arc<MetricsRegistry>,
    registry: Arc<EndpointRegistry>,
    request_id_header: String,
    real_ip_header: String,
}

pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<GatewayState>,
    _sweeper: tokio::task::JoinHandle<()>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, store: Arc<dyn CoordinationStore>) -> Self {
        let registry = Arc::new(EndpointRegistry::spawn(
            store,
            RegistryConfig::new(config.service.clone()),
        ));
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&registry),
            config.pool.clone(),
        ));
        let metrics = Arc::new(MetricsRegistry::new());
        let dedup = Arc::new(MemoryDedupStore::new(
            Arc::new(SystemClock),
            config.retention,
        ));

        let sweeper = {
            let dedup = Arc::clone(&dedup);
            let period = config.retention.max(Duration::from_secs(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    dedup.sweep();
                }
            })
        };

        let pipeline = PipelineBuilder::new()
            .stage(Arc::new(
                ObservabilityStage::new(Arc::new(TracingSink), Arc::clone(&metrics))
                    .with_excluded_paths(config.observability_excluded_paths.clone()),
            ))
            .stage(Arc::new(
                IdempotencyStage::new(dedup)
                    .with_excluded_paths(config.idempotency_excluded_paths.clone()),
            ))
            .build();
        let router = GatewayRouter::new(config.routes.clone(), pool);

        let state = Arc::new(GatewayState {
            pipeline,
            router,
            metrics,
            registry,
            request_id_header: config.request_id_header.clone(),
            real_ip_header: config.real_ip_header.clone(),
        });

        Self {
            config,
            state,
            _sweeper: sweeper,
        }
    }

    /// Builds the axum application. Exposed for in-process tests.
    pub fn app(&self) -> Router {
        let mut app = Router::new();

        for (path, method) in self.state.router.table().entries() {
            let state = Arc::clone(&self.state);
            let route_path = path.to_string();
            let route_method = method.to_string();
            app = app.route(
                path,
                post(
                    move |ConnectInfo(peer): ConnectInfo<SocketAddr>,
                          headers: HeaderMap,
                          body: Bytes| {
                        let state = Arc::clone(&state);
                        let path = route_path.clone();
                        let method = route_method.clone();
                        async move { handle_rpc(state, method, path, peer, headers, body).await }
                    },
                ),
            );
        }

        let state = Arc::clone(&self.state);
        app = app.route(
            "/__health",
            get(move || {
                let state = Arc::clone(&state);
                async move {
                    Json(json!({
                        "status": "ok",
                        "endpoints": state.registry.current().len(),
                        "registry_stale": state.registry.is_stale(),
                    }))
                }
            }),
        );

        let state = Arc::clone(&self.state);
        app = app.route(
            "/__metrics",
            get(move || {
                let state = Arc::clone(&state);
                async move { Json(state.metrics.snapshot()) }
            }),
        );

        let state = Arc::clone(&self.state);
        app = app.route(
            "/__info",
            get(move || {
                let state = Arc::clone(&state);
                async move {
                    Json(ServerInfo::new(
                        ServerRole::Gateway,
                        state.metrics.uptime_ms(),
                    ))
                }
            }),
        );

        app.layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
    }

    /// Binds the configured address and serves until the process exits.
    /// Bind failure is the one fatal startup error.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(
            addr = %self.config.listen_addr,
            service = %self.config.service,
            "gateway listening"
        );
        self.serve_with(listener).await
    }

    /// Serves on an already-bound listener (tests bind port 0 themselves).
    pub async fn serve_with(self, listener: TcpListener) -> Result<()> {
        axum::serve(
            listener,
            self.app()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}

async fn handle_rpc(
    state: Arc<GatewayState>,
    method: String,
    path: String,
    peer: SocketAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let params: Value = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => {
                return response_for(Outcome::from_error(&PorticoError::InvalidRequest(
                    format!("malformed JSON body: {}", e),
                )));
            }
        }
    };

    let remote = header_value(&headers, &state.real_ip_header)
        .unwrap_or_else(|| peer.ip().to_string());
    let request_id = header_value(&headers, &state.request_id_header);

    let ctx = RequestContext::new(method, path)
        .with_remote(remote)
        .with_request_id(request_id)
        .with_params(params);

    // Dropping this future on client disconnect aborts the backend call;
    // the pipeline's guard still finalizes the dedup record and log entry.
    let outcome = state.pipeline.run(ctx, &state.router).await;

    response_for(outcome)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(String::from)
}

fn response_for(outcome: Outcome) -> Response {
    let status =
        StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(outcome.body)).into_response()
}

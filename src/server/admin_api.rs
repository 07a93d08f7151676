//! Admin / diagnostics HTTP API.
//!
//! - GET /health
//! - GET /metrics
//! - GET /v1/cache/stats
//! - POST /v1/cache/maintenance
//! - GET /v1/conversations?offset=&limit=
//! - GET /v1/threads/{thread_id}/messages?page=

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cache::evictor::MaintenanceReport;
use crate::engine::{Engine, EngineStats};
use crate::server::metrics::EngineMetrics;
use crate::snapshot::SnapshotPage;
use crate::source::Message;

/// Largest page a client may ask for.
const MAX_PAGE: usize = 200;

/// Application state shared across handlers.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub metrics: EngineMetrics,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            engine,
            metrics: EngineMetrics::new()?,
            start_time: Instant::now(),
        })
    }
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/maintenance", post(run_maintenance))
        .route("/v1/conversations", get(conversations))
        .route("/v1/threads/{thread_id}/messages", get(thread_messages))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub notifier_registered: bool,
    pub prefetch_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct MessagePageQuery {
    #[serde(default)]
    pub page: usize,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        notifier_registered: state.engine.notifier().is_registered(),
        prefetch_enabled: state.engine.scheduler().is_enabled(),
    })
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<EngineStats> {
    Json(state.engine.stats().await)
}

async fn run_maintenance(State(state): State<Arc<AppState>>) -> Json<MaintenanceReport> {
    info!("Manual maintenance requested");
    Json(state.engine.run_maintenance().await)
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, StatusCode> {
    state.metrics.observe(&state.engine.stats().await);
    let body = state.metrics.render().map_err(|e| {
        error!(error = %e, "Failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body))
}

async fn conversations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<SnapshotPage>, StatusCode> {
    let limit = query
        .limit
        .unwrap_or(state.engine.config().snapshot.page_size)
        .min(MAX_PAGE);

    state
        .engine
        .load_conversations(query.offset, limit)
        .await
        .map(Json)
        .map_err(|e| {
            warn!(offset = query.offset, limit, error = %e, "Conversation page failed");
            StatusCode::BAD_GATEWAY
        })
}

async fn thread_messages(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(query): Query<MessagePageQuery>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    state
        .engine
        .load_messages(&thread_id, query.page)
        .await
        .map(Json)
        .map_err(|e| {
            warn!(thread_id = %thread_id, page = query.page, error = %e, "Message page failed");
            StatusCode::BAD_GATEWAY
        })
}

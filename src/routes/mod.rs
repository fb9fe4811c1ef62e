// HTTP + WebSocket routes

mod http;
mod ws;

use axum::{Router, routing::get};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tower_http::cors::{Any, CorsLayer};

use crate::config::AppConfig;
use crate::ingest::IngestService;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) ingest: Arc<IngestService>,
    pub(crate) dashboard_connections: Arc<AtomicUsize>,
    pub(crate) config: AppConfig,
}

pub fn app(
    ingest: Arc<IngestService>,
    dashboard_connections: Arc<AtomicUsize>,
    config: AppConfig,
) -> Router {
    let state = AppState {
        ingest,
        dashboard_connections,
        config,
    };
    Router::new()
        .route("/", get(|| async { "vstats ingestion service" })) // GET /
        .route("/version", get(http::version_handler)) // GET /version
        .route("/api/agents", get(http::agents_handler)) // GET /api/agents
        .route("/ws/agent", get(ws::ws_agent)) // WS /ws/agent
        .route("/ws/dashboard", get(ws::ws_dashboard)) // WS /ws/dashboard
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

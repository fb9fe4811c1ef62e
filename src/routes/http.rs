// GET handlers: version, connected agents

use axum::{extract::State, response::IntoResponse};

use super::AppState;
use crate::version::{NAME, PROTOCOL_VERSION, VERSION};

/// GET /version: service name, version and wire protocol revision.
pub(super) async fn version_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "name": NAME,
        "version": VERSION,
        "protocol": PROTOCOL_VERSION,
    }))
}

/// GET /api/agents: connected sessions with their resume cursors and last live sample time.
pub(super) async fn agents_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.ingest.sessions().summaries())
}

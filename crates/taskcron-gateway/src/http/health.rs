use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — liveness probe, returns server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("TASKCRON_GIT_SHA"),
        "phase": format!("{:?}", state.engine.phase()).to_lowercase(),
        "in_flight": state.engine.in_flight(),
        "worker_count": state.config.scheduler.worker_count,
    }))
}

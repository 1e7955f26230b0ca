use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use taskcron_core::TaskcronConfig;
use taskcron_scheduler::{SchedulerLoop, TaskRegistry};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: TaskcronConfig,
    pub registry: TaskRegistry,
    /// The running tick loop, exposed read-only for health reporting.
    pub engine: Arc<SchedulerLoop>,
}

impl AppState {
    pub fn new(config: TaskcronConfig, registry: TaskRegistry, engine: Arc<SchedulerLoop>) -> Self {
        Self {
            config,
            registry,
            engine,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/tasks",
            get(crate::http::tasks::list_tasks).post(crate::http::tasks::create_task),
        )
        .route(
            "/tasks/{id}",
            get(crate::http::tasks::get_task).delete(crate::http::tasks::delete_task),
        )
        .route("/tasks/{id}/pause", post(crate::http::tasks::pause_task))
        .route("/tasks/{id}/resume", post(crate::http::tasks::resume_task))
        .route("/tasks/{id}/runs", get(crate::http::tasks::list_runs))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

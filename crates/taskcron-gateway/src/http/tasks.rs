//! Task management endpoints.
//!
//! | Method | Path                 | Action                         |
//! |--------|----------------------|--------------------------------|
//! | POST   | /tasks               | create, returns `{task_id}`    |
//! | GET    | /tasks[?status=...]  | list in creation order         |
//! | GET    | /tasks/{id}          | fetch one live task            |
//! | DELETE | /tasks/{id}          | logical delete (idempotent)    |
//! | POST   | /tasks/{id}/pause    | stop scheduling                |
//! | POST   | /tasks/{id}/resume   | resume scheduling              |
//! | GET    | /tasks/{id}/runs     | run history, oldest first      |
//!
//! Errors are `{ "error": { "kind": "...", "message": "..." } }`.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use taskcron_scheduler::{RunRecord, SchedulerError, Task, TaskFilter, TaskStatus};
use tracing::warn;

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(alias = "task_name")]
    pub name: String,
    #[serde(alias = "cron_expression")]
    pub recurrence: String,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

/// Public shape of a task in listings.
#[derive(Debug, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub name: String,
    pub recurrence: String,
    pub status: TaskStatus,
    pub next_due_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            name: task.name,
            recurrence: task.recurrence.to_string(),
            status: task.status,
            next_due_at: task.next_due_at,
            last_run_at: task.last_run_at,
        }
    }
}

/// Error body with a machine-readable `kind`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "ValidationError",
            message: message.into(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let status = match &e {
            err if err.is_validation() => StatusCode::BAD_REQUEST,
            SchedulerError::Conflict { .. } => StatusCode::CONFLICT,
            SchedulerError::TaskNotFound { .. } => StatusCode::NOT_FOUND,
            _ => {
                warn!(error = %e, "task request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

/// POST /tasks — create a task.
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::validation(e.body_text()))?;
    let task = state.registry.create(&req.name, &req.recurrence)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse { task_id: task.id }),
    ))
}

/// GET /tasks — list tasks in creation order, optionally by status.
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let filter = match query.status.as_deref() {
        None => TaskFilter::all(),
        Some(raw) => TaskFilter::with_status(raw.parse().map_err(ApiError::validation)?),
    };
    let tasks = state
        .registry
        .list(filter)
        .map(|task| task.map(TaskView::from))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(tasks))
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    Ok(Json(state.registry.get(&id)?.into()))
}

/// DELETE /tasks/{id} — logical delete.
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    Ok(Json(state.registry.delete(&id)?.into()))
}

/// POST /tasks/{id}/pause
pub async fn pause_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    Ok(Json(state.registry.pause(&id)?.into()))
}

/// POST /tasks/{id}/resume
pub async fn resume_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    Ok(Json(state.registry.resume(&id)?.into()))
}

/// GET /tasks/{id}/runs
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    Ok(Json(state.registry.runs(&id)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{build_router, AppState};
    use crate::sink::FileArtifactSink;
    use axum::{body::Body, http::Request, Router};
    use serde_json::Value;
    use taskcron_core::TaskcronConfig;
    use taskcron_scheduler::{
        EngineConfig, ManualClock, SchedulerLoop, SequentialIds, SqliteTaskStore, TaskRegistry,
        TaskStore,
    };
    use tower::ServiceExt;

    fn router() -> Router {
        let store: Arc<dyn TaskStore> =
            Arc::new(SqliteTaskStore::open_in_memory().expect("open"));
        let start = DateTime::parse_from_rfc3339("2024-01-01T10:00:00Z")
            .expect("bad timestamp")
            .with_timezone(&Utc);
        let clock = Arc::new(ManualClock::new(start));
        let config = TaskcronConfig::default();
        let registry = TaskRegistry::new(
            store.clone(),
            clock.clone(),
            Arc::new(SequentialIds::new("task")),
            config.scheduler.page_size,
        );
        let engine = Arc::new(SchedulerLoop::new(
            store,
            Arc::new(FileArtifactSink::new(std::env::temp_dir())),
            clock,
            EngineConfig::from(&config.scheduler),
        ));
        build_router(Arc::new(AppState::new(config, registry, engine)))
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let res = router.clone().oneshot(req).await.expect("response");
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    #[tokio::test]
    async fn create_then_list() {
        let app = router();
        let (status, body) = send(
            &app,
            "POST",
            "/tasks",
            Some(json!({"name": "daily-backup", "recurrence": "0 3 * * *"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["task_id"], "task-1");

        let (status, body) = send(&app, "GET", "/tasks", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["task_id"], "task-1");
        assert_eq!(body[0]["recurrence"], "0 3 * * *");
        assert_eq!(body[0]["status"], "active");
        assert_eq!(body[0]["next_due_at"], "2024-01-02T03:00:00Z");
        assert_eq!(body[0]["last_run_at"], Value::Null);
    }

    #[tokio::test]
    async fn accepts_legacy_field_names() {
        let app = router();
        let (status, _) = send(
            &app,
            "POST",
            "/tasks",
            Some(json!({"task_name": "legacy", "cron_expression": "*/5 * * * *"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            "POST",
            "/tasks",
            Some(json!({"task_name": "legacy", "cron_expression": "5 * * * *"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["task_id"], "task-1");
    }

    #[tokio::test]
    async fn create_errors_carry_kind() {
        let app = router();
        let (status, body) = send(
            &app,
            "POST",
            "/tasks",
            Some(json!({"name": "", "recurrence": "0 3 * * *"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "ValidationError");

        let (_, body) = send(
            &app,
            "POST",
            "/tasks",
            Some(json!({"name": "x", "recurrence": "0 3 * *"})),
        )
        .await;
        assert_eq!(body["error"]["kind"], "InvalidRecurrenceError");

        let (status, body) = send(&app, "POST", "/tasks", Some(json!({"name": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "ValidationError");
    }

    #[tokio::test]
    async fn status_filter_and_lifecycle() {
        let app = router();
        for name in ["a", "b", "c"] {
            send(
                &app,
                "POST",
                "/tasks",
                Some(json!({"name": name, "recurrence": "0 * * * *"})),
            )
            .await;
        }
        let (status, _) = send(&app, "DELETE", "/tasks/task-2", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, "DELETE", "/tasks/task-2", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, active) = send(&app, "GET", "/tasks?status=active", None).await;
        assert_eq!(active.as_array().map(Vec::len), Some(2));
        let (_, all) = send(&app, "GET", "/tasks", None).await;
        assert_eq!(all.as_array().map(Vec::len), Some(3));

        let (_, paused) = send(&app, "POST", "/tasks/task-1/pause", None).await;
        assert_eq!(paused["status"], "paused");
        let (_, resumed) = send(&app, "POST", "/tasks/task-1/resume", None).await;
        assert_eq!(resumed["status"], "active");

        let (status, body) = send(&app, "GET", "/tasks/task-2", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "NotFoundError");

        let (status, runs) = send(&app, "GET", "/tasks/task-2/runs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(runs, json!([]));

        let (status, body) = send(&app, "GET", "/tasks?status=archived", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "ValidationError");
    }

    #[tokio::test]
    async fn health_reports_idle_engine() {
        let app = router();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["phase"], "idle");
        assert_eq!(body["in_flight"], 0);
        assert!(body["commit"].as_str().is_some_and(|c| !c.is_empty()));
    }
}

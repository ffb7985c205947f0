//! Read-only admin API
//!
//! A thin JSON view over the same tables the engine runs on, for external
//! dashboards. Mount the router into any axum server:
//!
//! ```ignore
//! let app = stepq::admin::router(queue.storage());
//! axum::serve(listener, app).await?;
//! ```

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::events::job_event_key_prefix;
use crate::storage::{EventRow, StepRow, Storage, StoreError, TaskRow};
use crate::time;

#[derive(Clone)]
struct AdminState {
    storage: Arc<dyn Storage>,
}

/// Build the admin router over a storage handle.
pub fn router(storage: Arc<dyn Storage>) -> Router {
    Router::new()
        .route("/api/queues", get(list_queues))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:job", get(job_tasks))
        .route("/api/tasks/:id", get(task_detail))
        .route("/api/now", get(now))
        .with_state(AdminState { storage })
}

fn internal(e: StoreError) -> StatusCode {
    tracing::error!("admin query failed: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// GET /api/queues - all queue ids
async fn list_queues(State(state): State<AdminState>) -> Result<Json<Vec<String>>, StatusCode> {
    let queues = state.storage.list_queues().await.map_err(internal)?;
    Ok(Json(queues))
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    queue: String,
}

/// GET /api/jobs?queue=<q> - job ids within a queue
async fn list_jobs(
    State(state): State<AdminState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Vec<String>>, StatusCode> {
    let jobs = state
        .storage
        .list_jobs(&query.queue)
        .await
        .map_err(internal)?;
    Ok(Json(jobs))
}

#[derive(Debug, Deserialize)]
struct TasksQuery {
    queue: Option<String>,
}

/// GET /api/jobs/{job} - task rows for a job
async fn job_tasks(
    State(state): State<AdminState>,
    Path(job): Path<String>,
    Query(query): Query<TasksQuery>,
) -> Result<Json<Vec<TaskRow>>, StatusCode> {
    let tasks = state
        .storage
        .list_tasks(query.queue.as_deref(), &job)
        .await
        .map_err(internal)?;
    Ok(Json(tasks))
}

#[derive(Debug, Serialize)]
struct TaskDetail {
    task: TaskRow,
    steps: Vec<StepRow>,
    events: Vec<EventRow>,
    date: f64,
}

/// GET /api/tasks/{id} - one task with its steps and related events
async fn task_detail(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<TaskDetail>, StatusCode> {
    let id = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let task = state
        .storage
        .get_task_by_id(id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let steps = state.storage.list_steps(id).await.map_err(internal)?;
    let events = state
        .storage
        .list_events_by_prefix(&task.queue, &job_event_key_prefix(&task.job))
        .await
        .map_err(internal)?;
    Ok(Json(TaskDetail {
        task,
        steps,
        events,
        date: time::now(),
    }))
}

/// GET /api/now - current server time in Unix seconds
async fn now() -> Json<Value> {
    Json(json!({ "now": time::now() }))
}

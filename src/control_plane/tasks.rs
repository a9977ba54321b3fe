//! `POST /tasks`, `GET /tasks/{id}`, `POST /tasks/{id}/cancel`.

use std::time::{Duration, SystemTime};

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use crate::domain::{
    CapabilityName, CorrelationId, IdempotencyKey, MaxAttempts, Priority, Task, TaskId, TaskState,
};
use crate::scheduler::{SchedulerError, TaskScheduler, TaskSpec};

use super::{ApiError, SharedState};

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub capability: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Option<PriorityWire>,
    pub deadline_ms_from_now: Option<u64>,
    pub idempotency_key: Option<String>,
    pub max_attempts: Option<u8>,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityWire {
    Low,
    Normal,
    High,
}

impl From<PriorityWire> for Priority {
    fn from(value: PriorityWire) -> Self {
        match value {
            PriorityWire::Low => Priority::Low,
            PriorityWire::Normal => Priority::Normal,
            PriorityWire::High => Priority::High,
        }
    }
}

#[derive(Serialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub capability: String,
    pub state: TaskState,
    pub attempts: u32,
    pub owner_agent: Option<String>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.task_id,
            capability: task.capability.to_string(),
            state: task.state,
            attempts: task.attempts,
            owner_agent: task.owner_agent.map(|id| id.to_string()),
            result: task.result,
            last_error: task.last_error,
        }
    }
}

fn scheduler_error_response(error: SchedulerError, correlation_id: CorrelationId) -> ApiError {
    match error {
        SchedulerError::NotFound(id) => ApiError::new(StatusCode::NOT_FOUND, "not_found", format!("no task {id}"), correlation_id),
        SchedulerError::NoCapableAgent(capability) => {
            ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "no_capable_agent", format!("no agent advertises {capability}"), correlation_id)
        }
        SchedulerError::Overloaded { retry_after_ms } => {
            let mut error = ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "overloaded", "scheduler overloaded", correlation_id);
            error.details = Some(serde_json::json!({ "retry_after_ms": retry_after_ms }));
            error
        }
        SchedulerError::AlreadyTerminal(state) => {
            ApiError::new(StatusCode::CONFLICT, "already_terminal", format!("task already in terminal state {state:?}"), correlation_id)
        }
    }
}

pub async fn submit(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let capability = match CapabilityName::try_new(request.capability) {
        Ok(c) => c,
        Err(e) => return ApiError::new(StatusCode::BAD_REQUEST, "validation", e.to_string(), correlation_id).into_response(),
    };
    let idempotency_key = match request.idempotency_key.map(IdempotencyKey::try_new).transpose() {
        Ok(k) => k,
        Err(e) => return ApiError::new(StatusCode::BAD_REQUEST, "validation", e.to_string(), correlation_id).into_response(),
    };
    let max_attempts = match request.max_attempts.map(MaxAttempts::try_new).transpose() {
        Ok(k) => k,
        Err(e) => return ApiError::new(StatusCode::BAD_REQUEST, "validation", e.to_string(), correlation_id).into_response(),
    };

    let spec = TaskSpec {
        capability,
        payload: request.payload,
        priority: request.priority.map(Priority::from).unwrap_or(Priority::Normal),
        deadline: request.deadline_ms_from_now.map(|ms| SystemTime::now() + Duration::from_millis(ms)),
        idempotency_key,
        max_attempts,
    };

    match state.scheduler.submit(spec).await {
        Ok(task_id) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "task_id": task_id }))).into_response(),
        Err(error) => scheduler_error_response(error, correlation_id).into_response(),
    }
}

pub async fn status(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Path(id): Path<String>,
) -> Response {
    let Ok(task_id) = TaskId::parse(&id) else {
        return ApiError::new(StatusCode::BAD_REQUEST, "validation", "task id must be a uuid", correlation_id).into_response();
    };
    match state.scheduler.status(task_id).await {
        Ok(task) => Json(TaskView::from(task)).into_response(),
        Err(error) => scheduler_error_response(error, correlation_id).into_response(),
    }
}

pub async fn cancel(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Path(id): Path<String>,
) -> Response {
    let Ok(task_id) = TaskId::parse(&id) else {
        return ApiError::new(StatusCode::BAD_REQUEST, "validation", "task id must be a uuid", correlation_id).into_response();
    };
    match state.scheduler.cancel(task_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        // Cancelling an already-terminal task is idempotent, not an error.
        Err(SchedulerError::AlreadyTerminal(_)) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => scheduler_error_response(error, correlation_id).into_response(),
    }
}

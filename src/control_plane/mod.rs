//! Control-plane HTTP API: health/readiness, metrics,
//! registry CRUD, task submission, chat, and feedback, all under one
//! `axum::Router`.

mod agents;
mod chat;
mod feedback;
mod health;
mod tasks;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::action_gate::ActionGate;
use crate::bus::MessageBus;
use crate::domain::CorrelationId;
use crate::llm_gateway::LlmGateway;
use crate::memory::SharedMemory;
use crate::metrics::MetricsSink;
use crate::registry::AgentRegistry;
use crate::scheduler::InMemoryTaskScheduler;
use crate::stores::FeedbackStore;

/// Everything a handler needs, shared behind one `Arc` so `axum::State`
/// cloning is a refcount bump.
pub struct AppState {
    pub registry: Arc<dyn AgentRegistry>,
    pub scheduler: Arc<InMemoryTaskScheduler>,
    pub bus: Arc<dyn MessageBus>,
    pub llm_gateway: Arc<dyn LlmGateway>,
    pub action_gate: Arc<ActionGate>,
    pub memory: SharedMemory,
    pub feedback: Arc<dyn FeedbackStore>,
    pub metrics: MetricsSink,
    pub started_at: SystemTime,
    pub ready: Arc<AtomicBool>,
}

pub type SharedState = Arc<AppState>;

/// Uniform error body: `{error, message, correlation_id, details?}`.
#[derive(Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub error: String,
    pub message: String,
    pub correlation_id: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, error: &str, message: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self { status, error: error.to_string(), message: message.into(), correlation_id: correlation_id.to_string(), details: None }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

/// Adopts an inbound `Correlation-Id` header or mints one, threading it
/// through request extensions and echoing it on the response.
async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    let header = request.headers().get("Correlation-Id").and_then(|v| v.to_str().ok());
    let correlation_id = CorrelationId::adopt_or_generate(header);
    request.extensions_mut().insert(correlation_id);

    let span = crate::logging::correlation_span(correlation_id);
    let _guard = span.enter();

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        response.headers_mut().insert("Correlation-Id", value);
    }
    response
}

/// Builds the full router.
#[must_use]
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(health::metrics))
        .route("/agents", get(agents::list).post(agents::register))
        .route("/agents/{id}", get(agents::get).delete(agents::deregister))
        .route("/tasks", post(tasks::submit))
        .route("/tasks/{id}", get(tasks::status))
        .route("/tasks/{id}/cancel", post(tasks::cancel))
        .route("/chat", post(chat::send))
        .route("/chat/stream", post(chat::stream))
        .route("/feedback", post(feedback::submit))
        .route("/feedback/recent", get(feedback::recent))
        .route("/feedback/summary", get(feedback::summary))
        .layer(middleware::from_fn(correlation_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

//! `POST /feedback`, `GET /feedback/recent`, `GET /feedback/summary`

use std::time::SystemTime;

use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use crate::domain::{AgentId, CorrelationId, FeedbackId, FeedbackRecord, Rating};

use super::{ApiError, SharedState};

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub conversation_id: String,
    pub agent_id: Option<String>,
    pub rating: u8,
    pub success: bool,
    pub notes: Option<String>,
}

pub async fn submit(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let rating = match Rating::try_new(request.rating) {
        Ok(r) => r,
        Err(e) => return ApiError::new(StatusCode::BAD_REQUEST, "validation", e.to_string(), correlation_id).into_response(),
    };
    let agent_id = match request.agent_id.map(|s| AgentId::parse(&s)).transpose() {
        Ok(id) => id,
        Err(_) => return ApiError::new(StatusCode::BAD_REQUEST, "validation", "agent_id must be a uuid", correlation_id).into_response(),
    };

    let record = FeedbackRecord {
        id: FeedbackId::generate(),
        conversation_id: request.conversation_id,
        agent_id,
        rating,
        success: request.success,
        notes: request.notes,
        created_at: SystemTime::now(),
    };

    match state.feedback.insert(record).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(error) => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", error.to_string(), correlation_id).into_response(),
    }
}

#[derive(Deserialize)]
pub struct RecentQuery {
    limit: Option<u32>,
}

pub async fn recent(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Query(query): Query<RecentQuery>,
) -> Response {
    match state.feedback.recent(query.limit.unwrap_or(20)).await {
        Ok(records) => Json(records).into_response(),
        Err(error) => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", error.to_string(), correlation_id).into_response(),
    }
}

#[derive(Deserialize)]
pub struct SummaryQuery {
    agent_id: Option<String>,
}

pub async fn summary(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Query(query): Query<SummaryQuery>,
) -> Response {
    let agent_id = match query.agent_id.map(|s| AgentId::parse(&s)).transpose() {
        Ok(id) => id,
        Err(_) => return ApiError::new(StatusCode::BAD_REQUEST, "validation", "agent_id must be a uuid", correlation_id).into_response(),
    };

    let result = match agent_id {
        Some(agent_id) => state.feedback.summary_for_agent(agent_id).await,
        None => state.feedback.summary_global().await,
    };

    match result {
        Ok(summary) => Json(summary).into_response(),
        Err(error) => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", error.to_string(), correlation_id).into_response(),
    }
}

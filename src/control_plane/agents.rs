//! `POST/GET/DELETE /agents*`.

use std::collections::HashSet;

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AgentDescriptor, AgentId, AgentKind, AgentName, AgentStatus, CapabilityName, CorrelationId,
    DeclaredLimits,
};
use crate::registry::RegistryError;

use super::{ApiError, SharedState};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub kind: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub declared_limits: Option<DeclaredLimits>,
}

#[derive(Serialize)]
pub struct AgentView {
    pub agent_id: AgentId,
    pub name: String,
    pub kind: String,
    pub version: u64,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub degraded_reason: Option<String>,
}

impl From<crate::registry::AgentEntry> for AgentView {
    fn from(entry: crate::registry::AgentEntry) -> Self {
        Self {
            agent_id: entry.descriptor.agent_id,
            name: entry.descriptor.name.to_string(),
            kind: entry.descriptor.kind.to_string(),
            version: entry.descriptor.version,
            capabilities: entry.descriptor.capabilities.iter().map(ToString::to_string).collect(),
            status: entry.status,
            degraded_reason: entry.degraded_reason,
        }
    }
}

fn registry_error_response(error: RegistryError, correlation_id: CorrelationId) -> ApiError {
    match error {
        RegistryError::NotFound(id) => ApiError::new(StatusCode::NOT_FOUND, "not_found", format!("no agent {id}"), correlation_id),
        RegistryError::InvalidTransition { .. } => ApiError::new(StatusCode::CONFLICT, "invalid_transition", error.to_string(), correlation_id),
    }
}

pub async fn register(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    let name = match AgentName::try_new(request.name) {
        Ok(n) => n,
        Err(e) => return ApiError::new(StatusCode::BAD_REQUEST, "validation", e.to_string(), correlation_id).into_response(),
    };
    let kind = match AgentKind::try_new(request.kind) {
        Ok(k) => k,
        Err(e) => return ApiError::new(StatusCode::BAD_REQUEST, "validation", e.to_string(), correlation_id).into_response(),
    };
    let mut capabilities: HashSet<CapabilityName> = HashSet::new();
    for capability in request.capabilities {
        match CapabilityName::try_new(capability) {
            Ok(c) => {
                capabilities.insert(c);
            }
            Err(e) => return ApiError::new(StatusCode::BAD_REQUEST, "validation", e.to_string(), correlation_id).into_response(),
        }
    }

    let descriptor = AgentDescriptor {
        agent_id: AgentId::generate(),
        name,
        kind,
        version: 1,
        capabilities,
        config: request.config,
        declared_limits: request.declared_limits.unwrap_or_default(),
    };

    match state.registry.register(descriptor.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(AgentView::from(crate::registry::AgentEntry {
            descriptor,
            status: AgentStatus::Initializing,
            degraded_reason: None,
            last_heartbeat: None,
        })))
            .into_response(),
        Err(error) => registry_error_response(error, correlation_id).into_response(),
    }
}

pub async fn list(State(state): State<SharedState>) -> Json<Vec<AgentView>> {
    Json(state.registry.list().await.into_iter().map(AgentView::from).collect())
}

pub async fn get(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Path(id): Path<String>,
) -> Response {
    let Ok(agent_id) = AgentId::parse(&id) else {
        return ApiError::new(StatusCode::BAD_REQUEST, "validation", "agent id must be a uuid", correlation_id).into_response();
    };
    match state.registry.get(agent_id).await {
        Ok(entry) => Json(AgentView::from(entry)).into_response(),
        Err(error) => registry_error_response(error, correlation_id).into_response(),
    }
}

pub async fn deregister(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Path(id): Path<String>,
) -> Response {
    let Ok(agent_id) = AgentId::parse(&id) else {
        return ApiError::new(StatusCode::BAD_REQUEST, "validation", "agent id must be a uuid", correlation_id).into_response();
    };
    state.registry.deregister(agent_id).await;
    StatusCode::NO_CONTENT.into_response()
}

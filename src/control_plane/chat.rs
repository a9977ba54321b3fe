//! `POST /chat` / `POST /chat/stream`.
//!
//! Streaming is newline-delimited JSON chunk framing: one `{delta|tool_call|
//! usage}` object per line, terminated by a final record carrying
//! `{correlation_id, usage}`.

use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use futures::stream;
use serde::{Deserialize, Serialize};

use crate::domain::{CorrelationId, GenerationParams, LlmOutput, LlmRequest, Message, RoleTag, StreamEvent, Usage};
use crate::llm_gateway::GatewayError;

use super::{ApiError, SharedState};

#[derive(Deserialize)]
pub struct ChatRequest {
    pub role_tag: RoleTagWire,
    pub messages: Vec<MessageWire>,
    #[serde(default)]
    pub params: GenerationParams,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleTagWire {
    Planning,
    Execution,
    Fast,
    Embedding,
    Custom(String),
}

impl From<RoleTagWire> for RoleTag {
    fn from(value: RoleTagWire) -> Self {
        match value {
            RoleTagWire::Planning => RoleTag::Planning,
            RoleTagWire::Execution => RoleTag::Execution,
            RoleTagWire::Fast => RoleTag::Fast,
            RoleTagWire::Embedding => RoleTag::Embedding,
            RoleTagWire::Custom(tag) => RoleTag::Custom(tag),
        }
    }
}

#[derive(Deserialize)]
pub struct MessageWire {
    pub role: String,
    pub content: String,
}

impl From<MessageWire> for Message {
    fn from(value: MessageWire) -> Self {
        Message { role: value.role, content: value.content }
    }
}

fn gateway_error_response(error: GatewayError, correlation_id: CorrelationId) -> ApiError {
    match error {
        GatewayError::NoProviderForRole => ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "no_provider_for_role", error.to_string(), correlation_id),
        GatewayError::AllProvidersExhausted => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable", error.to_string(), correlation_id),
    }
}

fn to_request(request: ChatRequest) -> LlmRequest {
    LlmRequest {
        role_tag: request.role_tag.into(),
        messages: request.messages.into_iter().map(Message::from).collect(),
        tools: None,
        params: request.params,
    }
}

#[derive(Serialize)]
struct ChatResponse {
    output: LlmOutput,
    usage: Usage,
    provider: String,
    model: String,
    correlation_id: CorrelationId,
}

pub async fn send(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Json(request): Json<ChatRequest>,
) -> Response {
    match state.llm_gateway.invoke(to_request(request)).await {
        Ok(response) => Json(ChatResponse {
            output: response.output,
            usage: response.usage,
            provider: response.provider,
            model: response.model,
            correlation_id,
        })
        .into_response(),
        Err(error) => gateway_error_response(error, correlation_id).into_response(),
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChunkWire {
    Delta { text: String },
    ToolCall { name: String, arguments: serde_json::Value },
    Usage { usage: Usage },
    Done { correlation_id: CorrelationId },
}

pub async fn stream(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let mut receiver = match state.llm_gateway.invoke_streaming(to_request(request)).await {
        Ok(receiver) => receiver,
        Err(error) => return gateway_error_response(error, correlation_id).into_response(),
    };

    let body_stream = stream::unfold((receiver, false), move |(mut receiver, done)| async move {
        if done {
            return None;
        }
        match receiver.recv().await {
            Some(StreamEvent::Delta(text)) => Some((Ok::<_, std::io::Error>(line(&ChunkWire::Delta { text })), (receiver, false))),
            Some(StreamEvent::ToolCall(call)) => {
                Some((Ok(line(&ChunkWire::ToolCall { name: call.name, arguments: call.arguments })), (receiver, false)))
            }
            Some(StreamEvent::Usage(usage)) => Some((Ok(line(&ChunkWire::Usage { usage })), (receiver, false))),
            None => Some((Ok(line(&ChunkWire::Done { correlation_id })), (receiver, true))),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn line(chunk: &ChunkWire) -> axum::body::Bytes {
    let mut json = serde_json::to_string(chunk).unwrap_or_default();
    json.push('\n');
    axum::body::Bytes::from(json)
}

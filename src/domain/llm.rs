//! LLM Gateway request/response shapes.

use serde::{Deserialize, Serialize};

/// Abstract role the caller wants a model for; the gateway's router maps
/// this to a concrete provider/model alias via config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleTag {
    Planning,
    Execution,
    Fast,
    Embedding,
    Custom(String),
}

/// A single chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Free-form generation parameters (temperature, max tokens, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub extra: serde_json::Value,
}

/// A request dispatched to the LLM Gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub role_tag: RoleTag,
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolSpec>>,
    pub params: GenerationParams,
}

/// A call to a tool the model requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The generated content of a successful call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LlmOutput {
    Text(String),
    ToolCalls(Vec<ToolCall>),
}

/// Token/latency accounting for one call. Never lost even on failure — a
/// failed attempt still reports whatever partial usage it measured.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
}

/// A completed LLM Gateway response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub output: LlmOutput,
    pub usage: Usage,
    pub provider: String,
    pub model: String,
}

/// Provider error categories the gateway classifies failures into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderErrorCategory {
    Auth,
    RateLimit,
    Server,
    Client,
    Timeout,
    ContentFilter,
    Unknown,
}

/// A single streamed chunk from `stream_complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    Delta(String),
    ToolCall(ToolCall),
    Usage(Usage),
}

//! Core data model: the entities every subsystem shares.

pub mod action;
pub mod agent;
pub mod envelope;
pub mod feedback;
pub mod ids;
pub mod llm;
pub mod memory;
pub mod task;

pub use action::{ActionCategory, ActionRecord, ActionStatus};
pub use agent::{
    AgentDescriptor, AgentKind, AgentName, AgentStatus, BaseTimeoutMs, CapabilityName,
    DeclaredLimits, HealthReport, HeartbeatReport, MaxInFlight, QueueDepth,
};
pub use envelope::{DeadlineExceeded, Envelope, EnvelopeKind};
pub use feedback::{FeedbackRecord, FeedbackSummary, Rating};
pub use ids::{AgentId, CorrelationId, EnvelopeId, FeedbackId, NodeId, TaskId};
pub use ids::ActionId;
pub use llm::{
    GenerationParams, LlmOutput, LlmRequest, LlmResponse, Message, ProviderErrorCategory, RoleTag,
    StreamEvent, ToolCall, ToolSpec, Usage,
};
pub use memory::{MemoryItem, MemoryLayer, OwnerScope, SearchHit};
pub use task::{
    BackoffPolicy, ExpiryReason, IdempotencyKey, InvalidTaskTransition, MaxAttempts, Priority,
    Task, TaskOutcome, TaskState,
};

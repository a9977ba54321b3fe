//! Core error taxonomy.

use thiserror::Error;

use crate::domain::{AgentId, TaskId};

/// The classification assigned to every failure the core can
/// surface, independent of which subsystem raised it. The control-plane maps
/// a `kind()` to an HTTP status; the scheduler maps it to a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    PermissionDenied,
    ApprovalRejected,
    Backpressured,
    Overloaded,
    ProviderUnavailable,
    TimedOut,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind may be retried by the scheduler,
    /// subject to the task's own attempt budget.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Backpressured
                | Self::Overloaded
                | Self::ProviderUnavailable
                | Self::TimedOut
                | Self::DeadlineExceeded
        )
    }
}

/// The crate-wide error type. Every subsystem's own error enum converts into
/// this at its boundary via `#[from]`, keeping one top-level error wrapping
/// component-specific ones.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("approval rejected: {0}")]
    ApprovalRejected(String),

    #[error("backpressured: {retry_after_ms}ms")]
    Backpressured { retry_after_ms: u64 },

    #[error("overloaded: {retry_after_ms}ms")]
    Overloaded { retry_after_ms: u64 },

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("deadline exceeded for task {task_id}")]
    DeadlineExceeded { task_id: TaskId },

    #[error("cancelled")]
    Cancelled,

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Classifies this error for HTTP-status-mapping and retry decisions.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) | Self::AgentNotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::ApprovalRejected(_) => ErrorKind::ApprovalRejected,
            Self::Backpressured { .. } => ErrorKind::Backpressured,
            Self::Overloaded { .. } => ErrorKind::Overloaded,
            Self::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            Self::TimedOut(_) => ErrorKind::TimedOut,
            Self::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) | Self::Storage(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

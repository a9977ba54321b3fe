//! Scheduled tasks.

use std::time::SystemTime;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use super::agent::CapabilityName;
use super::ids::{AgentId, TaskId};

/// Caller-supplied key used to deduplicate re-submission within the idempotency window.
#[nutype(
    validate(len_char_min = 1, len_char_max = 200),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct IdempotencyKey(String);

/// Task priority, used as a routing and concurrency tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Maximum retry attempts before a task is terminally `Failed`.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 20),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Default, TryFrom, Into),
    default = 3
)]
pub struct MaxAttempts(u8);

/// Base delay for exponential backoff between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
}

impl BackoffPolicy {
    /// `base * 2^(attempts-1)`, before jitter is applied. `attempts` is 1-indexed
    /// (the delay before the *second* attempt uses `attempts = 1`).
    #[must_use]
    pub fn delay_before_retry_ms(&self, attempts: u32) -> u64 {
        self.base_ms.saturating_mul(1u64 << attempts.min(32).saturating_sub(1).min(31))
    }
}

/// Monotonic task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Routed,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
}

impl TaskState {
    /// Whether this state has no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled | Self::Expired)
    }

    /// Validates the transitions the state machine allows, including the
    /// explicit `Routed -> Pending` re-route exception.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use TaskState::{Cancelled, Expired, Failed, Pending, Routed, Running, Succeeded};
        if self.is_terminal() {
            return false;
        }
        matches!(
            (*self, next),
            (Pending, Routed)
                | (Routed, Pending)
                | (Routed, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
                | (Pending | Routed | Running, Expired)
                | (Pending | Routed | Running, Cancelled)
                | (Pending | Routed | Running, Failed)
        )
    }
}

/// Reason a task expired without completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryReason {
    NoCapableAgent,
    DeadlineElapsed,
}

/// A submitted unit of work routed by capability to a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub idempotency_key: Option<IdempotencyKey>,
    pub capability: CapabilityName,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub submitted_at: SystemTime,
    pub deadline: SystemTime,
    pub attempts: u32,
    pub max_attempts: MaxAttempts,
    pub backoff: BackoffPolicy,
    pub state: TaskState,
    pub owner_agent: Option<AgentId>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl Task {
    /// Attempts the state transition, returning an error describing the
    /// rejected move rather than silently ignoring it.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTaskTransition`] if `self.state` cannot move to `next`.
    pub fn transition(&mut self, next: TaskState) -> Result<(), InvalidTaskTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTaskTransition { from: self.state, to: next });
        }
        self.state = next;
        Ok(())
    }
}

/// Raised when a caller requests a task state transition the state machine forbids.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid task transition from {from:?} to {to:?}")]
pub struct InvalidTaskTransition {
    pub from: TaskState,
    pub to: TaskState,
}

/// The outcome an agent's `handle_task` returns to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskOutcome {
    Succeeded { result: serde_json::Value },
    RetryableFailure { reason: String },
    NonRetryableFailure { reason: String },
    Cancelled,
}

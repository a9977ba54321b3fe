//! Action Gate & Audit records.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::ids::{ActionId, AgentId, CorrelationId, TaskId};

/// Classification assigned to every side-effecting action the core performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionCategory {
    Read,
    Write,
    External,
    Risky,
}

/// Audit/approval lifecycle of one action. Invariant: `Executed` for a
/// `risky` action implies a preceding `Approved` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
}

/// An append-only audit record, keyed by `correlation_id` so a single
/// external request can be reconstructed end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: ActionId,
    pub correlation_id: CorrelationId,
    pub agent_id: Option<AgentId>,
    pub task_id: Option<TaskId>,
    pub action_type: String,
    pub category: ActionCategory,
    pub inputs_redacted: serde_json::Value,
    pub outputs_redacted: Option<serde_json::Value>,
    pub status: ActionStatus,
    pub approver: Option<String>,
    pub created_at: SystemTime,
    pub executed_at: Option<SystemTime>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl ActionRecord {
    /// Whether this record satisfies the "risky implies approved before
    /// executed" invariant.
    #[must_use]
    pub fn satisfies_approval_invariant(&self) -> bool {
        if self.category != ActionCategory::Risky {
            return true;
        }
        !matches!(self.status, ActionStatus::Executed) || self.approver.is_some()
    }
}

//! Action Gate & Audit: classifies side-effecting actions, gates `risky`
//! ones behind approval, and persists an append-only audit trail.

mod audit_store;

pub use audit_store::InMemoryAuditStore;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::info;

use crate::config::{ApprovalConfig, ActionCategoryKey};
use crate::domain::{ActionCategory, ActionId, ActionRecord, ActionStatus, AgentId, CorrelationId, TaskId};
use crate::metrics::MetricsSink;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("approval for action {0} timed out")]
    ApprovalTimeout(ActionId),

    #[error("action {0} was rejected")]
    Rejected(ActionId),

    #[error("action execution failed: {0}")]
    ExecutionFailed(String),
}

/// Append-only storage for [`ActionRecord`]s.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert(&self, record: ActionRecord);
    async fn update(&self, record: ActionRecord);
    async fn get(&self, action_id: ActionId) -> Option<ActionRecord>;
    async fn list_by_correlation(&self, correlation_id: CorrelationId) -> Vec<ActionRecord>;
}

fn category_key(category: ActionCategory) -> ActionCategoryKey {
    match category {
        ActionCategory::Read => ActionCategoryKey::Read,
        ActionCategory::Write => ActionCategoryKey::Write,
        ActionCategory::External => ActionCategoryKey::External,
        ActionCategory::Risky => ActionCategoryKey::Risky,
    }
}

/// The parameters identifying one action exit, supplied by the caller at the
/// point the side effect would occur.
pub struct ActionContext {
    pub correlation_id: CorrelationId,
    pub agent_id: Option<AgentId>,
    pub task_id: Option<TaskId>,
    pub action_type: String,
    pub category: ActionCategory,
    pub inputs_redacted: serde_json::Value,
}

pub struct ActionGate {
    config: ApprovalConfig,
    audit: Arc<dyn AuditStore>,
    pending: DashMap<ActionId, oneshot::Sender<bool>>,
    metrics: MetricsSink,
}

impl ActionGate {
    #[must_use]
    pub fn new(config: ApprovalConfig, audit: Arc<dyn AuditStore>, metrics: MetricsSink) -> Self {
        Self { config, audit, pending: DashMap::new(), metrics }
    }

    /// Runs `op`, gating it behind an approval wait first if `ctx.category`
    /// requires one. `op` performs the actual side effect and returns its
    /// redacted output on success.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::ApprovalTimeout`]/[`GateError::Rejected`] if
    /// approval is required and doesn't arrive in time, or
    /// [`GateError::ExecutionFailed`] if `op` itself fails.
    pub async fn execute<F, Fut>(&self, ctx: ActionContext, op: F) -> Result<serde_json::Value, GateError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send,
    {
        let action_id = ActionId::generate();
        let mut record = ActionRecord {
            action_id,
            correlation_id: ctx.correlation_id,
            agent_id: ctx.agent_id,
            task_id: ctx.task_id,
            action_type: ctx.action_type,
            category: ctx.category,
            inputs_redacted: ctx.inputs_redacted,
            outputs_redacted: None,
            status: ActionStatus::Pending,
            approver: None,
            created_at: SystemTime::now(),
            executed_at: None,
            duration_ms: None,
            error: None,
        };

        let requires_approval = self.config.approval_required_for.contains(&category_key(ctx.category));

        if requires_approval {
            self.audit.insert(record.clone()).await;
            info!(%action_id, "action pending approval");

            let (tx, rx) = oneshot::channel();
            self.pending.insert(action_id, tx);

            let outcome = tokio::time::timeout(Duration::from_millis(self.config.approval_timeout_ms), rx).await;
            self.pending.remove(&action_id);

            match outcome {
                Ok(Ok(true)) => {
                    record.status = ActionStatus::Approved;
                    record.approver = Some("approver".to_string());
                }
                Ok(Ok(false)) => {
                    record.status = ActionStatus::Rejected;
                    self.audit.update(record).await;
                    return Err(GateError::Rejected(action_id));
                }
                _ => {
                    record.status = ActionStatus::Rejected;
                    record.error = Some("approval timed out".to_string());
                    self.audit.update(record).await;
                    return Err(GateError::ApprovalTimeout(action_id));
                }
            }
        } else {
            record.status = ActionStatus::Approved;
        }

        self.audit.update(record.clone()).await;

        let started = SystemTime::now();
        let result = op().await;
        let duration_ms = started.elapsed().unwrap_or(Duration::ZERO).as_millis() as u64;

        record.duration_ms = Some(duration_ms);
        record.executed_at = Some(SystemTime::now());

        self.metrics.observe_histogram("action_duration_seconds", vec![("action", record.action_type.clone())], duration_ms as f64 / 1000.0);

        match result {
            Ok(output) => {
                record.status = ActionStatus::Executed;
                record.outputs_redacted = Some(output.clone());
                self.metrics.incr_counter("tool_executions_total", vec![("action", record.action_type.clone()), ("status", "succeeded".to_string())]);
                self.audit.update(record).await;
                Ok(output)
            }
            Err(error) => {
                record.status = ActionStatus::Failed;
                record.error = Some(error.clone());
                self.metrics.incr_counter("tool_executions_total", vec![("action", record.action_type.clone()), ("status", "failed".to_string())]);
                self.audit.update(record).await;
                Err(GateError::ExecutionFailed(error))
            }
        }
    }

    /// Resolves a pending approval (control-plane `POST /actions/{id}/approve`).
    /// Returns `false` if no such pending action exists (already resolved or
    /// never required approval).
    pub fn resolve_approval(&self, action_id: ActionId, approved: bool) -> bool {
        if let Some((_, sender)) = self.pending.remove(&action_id) {
            let _ = sender.send(approved);
            true
        } else {
            false
        }
    }

    pub async fn history_for(&self, correlation_id: CorrelationId) -> Vec<ActionRecord> {
        self.audit.list_by_correlation(correlation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(category: ActionCategory) -> ActionContext {
        ActionContext {
            correlation_id: CorrelationId::generate(),
            agent_id: None,
            task_id: None,
            action_type: "send_email".to_string(),
            category,
            inputs_redacted: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn non_risky_action_auto_approves_and_executes() {
        let gate = ActionGate::new(ApprovalConfig::default(), Arc::new(InMemoryAuditStore::new()), MetricsSink::new());
        let result = gate.execute(ctx(ActionCategory::Write), || async { Ok(serde_json::json!({"ok": true})) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn risky_action_without_approval_times_out() {
        let mut config = ApprovalConfig::default();
        config.approval_timeout_ms = 20;
        let gate = ActionGate::new(config, Arc::new(InMemoryAuditStore::new()), MetricsSink::new());
        let result = gate.execute(ctx(ActionCategory::Risky), || async { Ok(serde_json::json!({})) }).await;
        assert!(matches!(result, Err(GateError::ApprovalTimeout(_))));
    }

    #[tokio::test]
    async fn risky_action_approved_externally_executes() {
        let mut config = ApprovalConfig::default();
        config.approval_timeout_ms = 5_000;
        let audit = Arc::new(InMemoryAuditStore::new());
        let gate = Arc::new(ActionGate::new(config, audit, MetricsSink::new()));

        let gate_clone = gate.clone();
        let handle = tokio::spawn(async move { gate_clone.execute(ctx(ActionCategory::Risky), || async { Ok(serde_json::json!({"done": true})) }).await });

        // Give the execute() call a moment to register its pending approval.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending_id = *gate.pending.iter().next().unwrap().key();
        assert!(gate.resolve_approval(pending_id, true));

        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }
}

//! In-memory append-only audit log, keyed by `correlation_id`.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{ActionId, ActionRecord, CorrelationId};

use super::AuditStore;

/// Keeps every version of a record (the "append-only" part); callers that
/// want the current view use [`AuditStore::get`], which returns the latest.
pub struct InMemoryAuditStore {
    latest: DashMap<ActionId, ActionRecord>,
    by_correlation: DashMap<CorrelationId, Vec<ActionId>>,
}

impl InMemoryAuditStore {
    #[must_use]
    pub fn new() -> Self {
        Self { latest: DashMap::new(), by_correlation: DashMap::new() }
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn insert(&self, record: ActionRecord) {
        self.by_correlation.entry(record.correlation_id).or_default().push(record.action_id);
        self.latest.insert(record.action_id, record);
    }

    async fn update(&self, record: ActionRecord) {
        if !self.latest.contains_key(&record.action_id) {
            self.by_correlation.entry(record.correlation_id).or_default().push(record.action_id);
        }
        self.latest.insert(record.action_id, record);
    }

    async fn get(&self, action_id: ActionId) -> Option<ActionRecord> {
        self.latest.get(&action_id).map(|entry| entry.value().clone())
    }

    async fn list_by_correlation(&self, correlation_id: CorrelationId) -> Vec<ActionRecord> {
        self.by_correlation
            .get(&correlation_id)
            .map(|ids| ids.iter().filter_map(|id| self.latest.get(id).map(|entry| entry.value().clone())).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActionCategory, ActionStatus, AgentId};
    use std::time::SystemTime;

    fn record(correlation_id: CorrelationId) -> ActionRecord {
        ActionRecord {
            action_id: ActionId::generate(),
            correlation_id,
            agent_id: Some(AgentId::generate()),
            task_id: None,
            action_type: "notify".into(),
            category: ActionCategory::External,
            inputs_redacted: serde_json::json!({}),
            outputs_redacted: None,
            status: ActionStatus::Pending,
            approver: None,
            created_at: SystemTime::now(),
            executed_at: None,
            duration_ms: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn update_overwrites_latest_but_keeps_history_index() {
        let store = InMemoryAuditStore::new();
        let correlation_id = CorrelationId::generate();
        let mut r = record(correlation_id);
        store.insert(r.clone()).await;
        r.status = ActionStatus::Executed;
        store.update(r.clone()).await;

        let fetched = store.get(r.action_id).await.unwrap();
        assert_eq!(fetched.status, ActionStatus::Executed);
        assert_eq!(store.list_by_correlation(correlation_id).await.len(), 1);
    }
}

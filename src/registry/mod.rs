//! The agent registry: identity, capability, and lifecycle-status catalog.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::info;

use crate::domain::{AgentDescriptor, AgentId, AgentStatus, CapabilityName, HeartbeatReport};

/// Failures the registry can report.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    NotFound(AgentId),

    #[error("invalid transition for {agent_id}: {from:?} -> {to:?}")]
    InvalidTransition { agent_id: AgentId, from: AgentStatus, to: AgentStatus },
}

/// One row as returned by a registry listing/lookup.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub descriptor: AgentDescriptor,
    pub status: AgentStatus,
    pub degraded_reason: Option<String>,
    pub last_heartbeat: Option<HeartbeatReport>,
}

/// The registry interface every other subsystem depends on.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Registers or re-registers `descriptor`, entering `Initializing`.
    async fn register(&self, descriptor: AgentDescriptor) -> Result<(), RegistryError>;

    /// Removes an agent's entry entirely. Idempotent.
    async fn deregister(&self, agent_id: AgentId);

    /// Fetches a single agent's full entry.
    async fn get(&self, agent_id: AgentId) -> Result<AgentEntry, RegistryError>;

    /// Lists every agent advertising `capability`, regardless of status.
    async fn find_by_capability(&self, capability: &CapabilityName) -> Vec<AgentEntry>;

    /// Lists every registered agent.
    async fn list(&self) -> Vec<AgentEntry>;

    /// Applies a status transition, rejecting it if
    /// [`AgentStatus::can_transition_to`] disallows it.
    async fn transition(
        &self,
        agent_id: AgentId,
        to: AgentStatus,
        degraded_reason: Option<String>,
    ) -> Result<(), RegistryError>;

    /// Records a heartbeat sample for `agent_id`, used by the supervisor's
    /// staleness check.
    async fn record_heartbeat(&self, agent_id: AgentId, report: HeartbeatReport) -> Result<(), RegistryError>;
}

struct Row {
    descriptor: AgentDescriptor,
    status: AgentStatus,
    degraded_reason: Option<String>,
    last_heartbeat: Option<HeartbeatReport>,
}

/// The in-memory registry backing the control plane. Persistence (if the
/// deployment wants a restart-durable catalog) lives behind the
/// [`crate::stores`] traits and replays into this cache at startup.
pub struct InMemoryAgentRegistry {
    rows: DashMap<AgentId, Row>,
}

impl InMemoryAgentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { rows: DashMap::new() }
    }

    fn to_entry(row: &Row) -> AgentEntry {
        AgentEntry {
            descriptor: row.descriptor.clone(),
            status: row.status,
            degraded_reason: row.degraded_reason.clone(),
            last_heartbeat: row.last_heartbeat,
        }
    }
}

impl Default for InMemoryAgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn register(&self, descriptor: AgentDescriptor) -> Result<(), RegistryError> {
        info!(agent_id = %descriptor.agent_id, name = %descriptor.name, "agent registered");
        self.rows.insert(
            descriptor.agent_id,
            Row { descriptor, status: AgentStatus::Initializing, degraded_reason: None, last_heartbeat: None },
        );
        Ok(())
    }

    async fn deregister(&self, agent_id: AgentId) {
        self.rows.remove(&agent_id);
    }

    async fn get(&self, agent_id: AgentId) -> Result<AgentEntry, RegistryError> {
        self.rows.get(&agent_id).map(|row| Self::to_entry(&row)).ok_or(RegistryError::NotFound(agent_id))
    }

    async fn find_by_capability(&self, capability: &CapabilityName) -> Vec<AgentEntry> {
        self.rows
            .iter()
            .filter(|row| row.descriptor.has_capability(capability))
            .map(|row| Self::to_entry(&row))
            .collect()
    }

    async fn list(&self) -> Vec<AgentEntry> {
        self.rows.iter().map(|row| Self::to_entry(&row)).collect()
    }

    async fn transition(
        &self,
        agent_id: AgentId,
        to: AgentStatus,
        degraded_reason: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut row = self.rows.get_mut(&agent_id).ok_or(RegistryError::NotFound(agent_id))?;
        if !row.status.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition { agent_id, from: row.status, to });
        }
        row.status = to;
        row.degraded_reason = if to == AgentStatus::Degraded { degraded_reason } else { None };
        Ok(())
    }

    async fn record_heartbeat(&self, agent_id: AgentId, report: HeartbeatReport) -> Result<(), RegistryError> {
        let mut row = self.rows.get_mut(&agent_id).ok_or(RegistryError::NotFound(agent_id))?;
        row.last_heartbeat = Some(report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::SystemTime;

    use super::*;
    use crate::domain::{AgentKind, AgentName, DeclaredLimits};

    fn descriptor() -> AgentDescriptor {
        let mut capabilities = HashSet::new();
        capabilities.insert(CapabilityName::try_from("echo".to_string()).unwrap());
        AgentDescriptor {
            agent_id: AgentId::generate(),
            name: AgentName::try_from("echo-agent".to_string()).unwrap(),
            kind: AgentKind::try_from("utility".to_string()).unwrap(),
            version: 1,
            capabilities,
            config: serde_json::json!({}),
            declared_limits: DeclaredLimits::default(),
        }
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let registry = InMemoryAgentRegistry::new();
        let descriptor = descriptor();
        let agent_id = descriptor.agent_id;
        registry.register(descriptor).await.unwrap();
        let entry = registry.get(agent_id).await.unwrap();
        assert_eq!(entry.status, AgentStatus::Initializing);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let registry = InMemoryAgentRegistry::new();
        let descriptor = descriptor();
        let agent_id = descriptor.agent_id;
        registry.register(descriptor).await.unwrap();
        let result = registry.transition(agent_id, AgentStatus::Stopped, None).await;
        assert!(matches!(result, Err(RegistryError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn find_by_capability_filters() {
        let registry = InMemoryAgentRegistry::new();
        registry.register(descriptor()).await.unwrap();
        let found = registry.find_by_capability(&CapabilityName::try_from("echo".to_string()).unwrap()).await;
        assert_eq!(found.len(), 1);
        let missing = registry.find_by_capability(&CapabilityName::try_from("other".to_string()).unwrap()).await;
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_is_recorded() {
        let registry = InMemoryAgentRegistry::new();
        let descriptor = descriptor();
        let agent_id = descriptor.agent_id;
        registry.register(descriptor).await.unwrap();
        registry
            .record_heartbeat(agent_id, HeartbeatReport { at: SystemTime::now(), mailbox_latency_ms: 5, self_reported_degraded: false })
            .await
            .unwrap();
        let entry = registry.get(agent_id).await.unwrap();
        assert!(entry.last_heartbeat.is_some());
    }
}

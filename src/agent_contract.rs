//! The trait an in-process agent implements to receive envelopes and tasks.
//! Agents here are ordinary Rust objects registered with the
//! [`crate::registry::AgentRegistry`], not sandboxed components.

use async_trait::async_trait;

use crate::domain::{Envelope, HealthReport, Task, TaskOutcome};
use crate::error::CoreError;

/// Implemented by every agent the core can route work to.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Runs once after registration, before the agent is marked `Ready`.
    async fn initialize(&self) -> Result<(), CoreError> {
        Ok(())
    }

    /// Runs on graceful shutdown, after the supervisor has stopped routing
    /// new work but before the agent is deregistered.
    async fn shutdown(&self) -> Result<(), CoreError> {
        Ok(())
    }

    /// Self-reported liveness, polled by the supervisor alongside heartbeat
    /// staleness checks.
    async fn health(&self) -> HealthReport {
        HealthReport::Ok
    }

    /// Handles an inbound envelope addressed to this agent outside the task
    /// scheduler (direct agent-to-agent messaging).
    async fn handle_envelope(&self, envelope: Envelope) -> Result<Option<Envelope>, CoreError>;

    /// Executes a scheduled task.
    async fn handle_task(&self, task: &Task) -> Result<TaskOutcome, CoreError>;
}

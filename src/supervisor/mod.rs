//! The supervisor: periodic liveness probing, restart policy, quarantine,
//! and graceful fleet shutdown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent_contract::Agent;
use crate::bus::{Mailbox, MessageBus};
use crate::config::SupervisorConfig;
use crate::domain::{AgentId, AgentStatus, HealthReport, HeartbeatReport};
use crate::metrics::MetricsSink;
use crate::registry::AgentRegistry;
use crate::scheduler::backoff::{jittered_delay_ms, JitterSource};
use crate::time_provider::TimeProvider;

/// Produces a fresh agent instance on restart. Registered alongside an
/// agent's descriptor so the supervisor never needs to know concrete agent
/// types.
pub type AgentFactory = Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("agent {0} has no registered factory, cannot restart")]
    NoFactory(AgentId),
}

struct RestartTracker {
    attempts_in_window: VecDeque<SystemTime>,
}

impl RestartTracker {
    fn new() -> Self {
        Self { attempts_in_window: VecDeque::new() }
    }

    fn record_and_check(&mut self, now: SystemTime, window: Duration, ceiling: u32) -> bool {
        while self.attempts_in_window.front().is_some_and(|t| now.duration_since(*t).unwrap_or(Duration::ZERO) > window) {
            self.attempts_in_window.pop_front();
        }
        self.attempts_in_window.push_back(now);
        self.attempts_in_window.len() as u32 > ceiling
    }
}

/// Periodically probes every registered agent and enforces the restart/
/// quarantine policy.
pub struct Supervisor {
    config: SupervisorConfig,
    registry: Arc<dyn AgentRegistry>,
    bus: Arc<dyn MessageBus>,
    agents: Arc<DashMap<AgentId, Arc<dyn Agent>>>,
    factories: DashMap<AgentId, AgentFactory>,
    restart_trackers: DashMap<AgentId, Mutex<RestartTracker>>,
    time: Arc<dyn TimeProvider>,
    metrics: MetricsSink,
    shutdown: CancellationToken,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<dyn AgentRegistry>,
        bus: Arc<dyn MessageBus>,
        agents: Arc<DashMap<AgentId, Arc<dyn Agent>>>,
        time: Arc<dyn TimeProvider>,
        metrics: MetricsSink,
    ) -> Self {
        Self {
            config,
            registry,
            bus,
            agents,
            factories: DashMap::new(),
            restart_trackers: DashMap::new(),
            time,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Registers the factory used to recreate `agent_id` on restart.
    pub fn register_factory(&self, agent_id: AgentId, factory: AgentFactory) {
        self.factories.insert(agent_id, factory);
    }

    /// Runs the probe loop until [`Supervisor::request_shutdown`] is called.
    /// Intended to be driven by a single long-lived `tokio::spawn`.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.probe_interval_ms));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => self.probe_all().await,
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn probe_all(&self) {
        let entries = self.registry.list().await;
        for entry in entries {
            if entry.status == AgentStatus::Stopped || entry.status == AgentStatus::Quarantined {
                continue;
            }
            self.probe_one(entry.descriptor.agent_id).await;
        }
    }

    async fn probe_one(&self, agent_id: AgentId) {
        let Some(agent) = self.agents.get(&agent_id).map(|a| a.clone()) else { return };
        let started = self.time.instant();
        let probe = tokio::time::timeout(Duration::from_millis(self.config.probe_timeout_ms), agent.health()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let report = match probe {
            Ok(HealthReport::Ok) => {
                if elapsed_ms >= self.config.probe_timeout_ms {
                    HealthReport::Degraded { reason: "probe latency at threshold".into() }
                } else {
                    HealthReport::Ok
                }
            }
            Ok(other) => other,
            Err(_) => HealthReport::Failed { reason: "health probe timed out".into() },
        };

        let _ = self
            .registry
            .record_heartbeat(
                agent_id,
                HeartbeatReport { at: SystemTime::now(), mailbox_latency_ms: elapsed_ms, self_reported_degraded: matches!(report, HealthReport::Degraded { .. }) },
            )
            .await;

        match report {
            HealthReport::Ok => {
                if let Ok(entry) = self.registry.get(agent_id).await {
                    if entry.status == AgentStatus::Degraded {
                        let _ = self.registry.transition(agent_id, AgentStatus::Ready, None).await;
                    }
                }
            }
            HealthReport::Degraded { reason } => {
                let _ = self.registry.transition(agent_id, AgentStatus::Degraded, Some(reason)).await;
            }
            HealthReport::Failed { reason } => {
                warn!(%agent_id, %reason, "agent probe failed");
                self.metrics.incr_counter("agent_runs_total", vec![("agent", agent_id.to_string()), ("status", "failed_probe".to_string())]);
                self.handle_failure(agent_id).await;
            }
        }
    }

    async fn handle_failure(&self, agent_id: AgentId) {
        let tracker_lock = self.restart_trackers.entry(agent_id).or_insert_with(|| Mutex::new(RestartTracker::new()));
        let exceeded = {
            let mut tracker = tracker_lock.lock().await;
            tracker.record_and_check(
                self.time.now(),
                Duration::from_millis(self.config.restart_window_ms),
                self.config.max_restart_attempts,
            )
        };

        if exceeded {
            error!(%agent_id, "restart ceiling exceeded, quarantining");
            let _ = self.registry.transition(agent_id, AgentStatus::Quarantined, Some("restart ceiling exceeded".into())).await;
            return;
        }

        if let Err(err) = self.restart(agent_id).await {
            error!(%agent_id, %err, "restart failed");
        }
    }

    async fn restart(&self, agent_id: AgentId) -> Result<(), SupervisorError> {
        let attempts = self.restart_trackers.get(&agent_id).map(|t| t.try_lock().map(|g| g.attempts_in_window.len()).unwrap_or(1)).unwrap_or(1) as u32;
        let mut jitter = JitterSource::seeded(u64::from(attempts).wrapping_mul(2_654_435_761).max(1));
        let delay = jittered_delay_ms(&crate::domain::BackoffPolicy { base_ms: 500 }, attempts, jitter.next());
        self.time.sleep(Duration::from_millis(delay)).await;

        if let Some(agent) = self.agents.get(&agent_id).map(|a| a.clone()) {
            let _ = agent.shutdown().await;
        }

        let factory = self.factories.get(&agent_id).map(|f| f.clone()).ok_or(SupervisorError::NoFactory(agent_id))?;
        let fresh = factory();
        if let Err(err) = fresh.initialize().await {
            warn!(%agent_id, %err, "re-initialize failed after restart");
        }
        self.agents.insert(agent_id, fresh);
        let _ = self.registry.transition(agent_id, AgentStatus::Ready, None).await;
        info!(%agent_id, "agent restarted");
        Ok(())
    }

    /// Stops admission, drains mailboxes up to `config.drain_deadline_ms`,
    /// calls every agent's `shutdown()`, then flushes metrics.
    pub async fn graceful_shutdown(&self) {
        self.request_shutdown();
        let deadline = Duration::from_millis(self.config.drain_deadline_ms);
        let entries = self.registry.list().await;

        for entry in &entries {
            let agent_id = entry.descriptor.agent_id;
            let _ = self.registry.transition(agent_id, AgentStatus::Stopped, None).await;
        }

        for entry in entries.iter().rev() {
            let agent_id = entry.descriptor.agent_id;
            if let Some(agent) = self.agents.get(&agent_id).map(|a| a.clone()) {
                let outcome = tokio::time::timeout(deadline, agent.shutdown()).await;
                if outcome.is_err() {
                    warn!(%agent_id, "shutdown exceeded drain deadline, forcing termination");
                }
            }
            self.bus.deregister(agent_id);
        }

        info!("supervisor graceful shutdown complete");
    }
}

/// Drains a mailbox's currently queued envelopes so shutdown can account for
/// in-flight work before giving up on an agent.
pub fn drain_remaining(mailbox: &mut Mailbox) -> usize {
    mailbox.drain().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryMessageBus;
    use crate::domain::{AgentDescriptor, AgentKind, AgentName, CapabilityName, DeclaredLimits, Envelope, Task, TaskOutcome};
    use crate::error::CoreError;
    use crate::registry::InMemoryAgentRegistry;
    use crate::time_provider::MockTimeProvider;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyAgent {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        async fn health(&self) -> HealthReport {
            if self.healthy.load(Ordering::Relaxed) {
                HealthReport::Ok
            } else {
                HealthReport::Failed { reason: "down".into() }
            }
        }

        async fn handle_envelope(&self, _envelope: Envelope) -> Result<Option<Envelope>, CoreError> {
            Ok(None)
        }

        async fn handle_task(&self, _task: &Task) -> Result<TaskOutcome, CoreError> {
            Ok(TaskOutcome::Succeeded { result: serde_json::json!({}) })
        }
    }

    async fn sample_descriptor() -> AgentDescriptor {
        let mut capabilities = HashSet::new();
        capabilities.insert(CapabilityName::try_new("echo".to_string()).unwrap());
        AgentDescriptor {
            agent_id: AgentId::generate(),
            name: AgentName::try_new("flaky".to_string()).unwrap(),
            kind: AgentKind::try_new("utility".to_string()).unwrap(),
            version: 1,
            capabilities,
            config: serde_json::json!({}),
            declared_limits: DeclaredLimits::default(),
        }
    }

    #[tokio::test]
    async fn failed_probe_eventually_quarantines() {
        let registry = Arc::new(InMemoryAgentRegistry::new());
        let bus = Arc::new(InMemoryMessageBus::new(crate::config::BusConfig::default(), MetricsSink::new()));
        let agents: Arc<DashMap<AgentId, Arc<dyn Agent>>> = Arc::new(DashMap::new());
        let descriptor = sample_descriptor().await;
        let agent_id = descriptor.agent_id;
        registry.register(descriptor).await.unwrap();
        registry.transition(agent_id, AgentStatus::Ready, None).await.unwrap();
        agents.insert(agent_id, Arc::new(FlakyAgent { healthy: AtomicBool::new(false) }));

        let mut config = SupervisorConfig::default();
        config.max_restart_attempts = 1;
        config.restart_window_ms = 60_000;

        let supervisor = Supervisor::new(config, registry.clone(), bus, agents, Arc::new(MockTimeProvider::new()), MetricsSink::new());
        supervisor.register_factory(agent_id, Arc::new(|| Arc::new(FlakyAgent { healthy: AtomicBool::new(false) }) as Arc<dyn Agent>));

        for _ in 0..5 {
            supervisor.probe_one(agent_id).await;
        }

        let entry = registry.get(agent_id).await.unwrap();
        assert_eq!(entry.status, AgentStatus::Quarantined);
    }
}

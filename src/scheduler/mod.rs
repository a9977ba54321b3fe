//! The task scheduler: capability routing, concurrency gating, retry, and
//! timeout enforcement.

pub mod backoff;

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::agent_contract::Agent;
use crate::config::SchedulerConfig;
use crate::domain::{
    AgentId, CapabilityName, IdempotencyKey, Priority, Task, TaskId, TaskOutcome, TaskState,
};
use crate::metrics::MetricsSink;
use crate::registry::AgentRegistry;
use crate::time_provider::TimeProvider;

use backoff::{jittered_delay_ms, JitterSource};

/// Failures `submit`/`cancel`/`status` can report.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no task found with id {0}")]
    NotFound(TaskId),

    #[error("no agent advertises capability {0}")]
    NoCapableAgent(CapabilityName),

    #[error("scheduler overloaded, retry after {retry_after_ms}ms")]
    Overloaded { retry_after_ms: u64 },

    #[error("task already terminal: {0:?}")]
    AlreadyTerminal(TaskState),
}

/// Caller-facing submission request; distinct from [`Task`] because the
/// caller doesn't choose a `task_id` or `state`.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub capability: CapabilityName,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub deadline: Option<SystemTime>,
    pub idempotency_key: Option<IdempotencyKey>,
    pub max_attempts: Option<crate::domain::MaxAttempts>,
}

#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Submits work, returning the (possibly pre-existing, if
    /// `idempotency_key` matched) task's id.
    async fn submit(&self, spec: TaskSpec) -> Result<TaskId, SchedulerError>;

    /// Requests cancellation. Idempotent; a no-op on an already-terminal task.
    async fn cancel(&self, task_id: TaskId) -> Result<(), SchedulerError>;

    /// Fetches a task's current snapshot.
    async fn status(&self, task_id: TaskId) -> Result<Task, SchedulerError>;
}

const FAILURE_WINDOW: usize = 20;

#[derive(Default)]
struct AgentLoad {
    in_flight: AtomicU32,
    recent_outcomes: Mutex<VecDeque<bool>>,
}

impl AgentLoad {
    async fn failure_rate(&self) -> f64 {
        let outcomes = self.recent_outcomes.lock().await;
        if outcomes.is_empty() {
            return 0.0;
        }
        let failures = outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / outcomes.len() as f64
    }

    async fn record(&self, succeeded: bool) {
        let mut outcomes = self.recent_outcomes.lock().await;
        outcomes.push_back(succeeded);
        if outcomes.len() > FAILURE_WINDOW {
            outcomes.pop_front();
        }
    }
}

fn stable_hash(task_id: TaskId, agent_id: AgentId) -> u64 {
    let mut hasher = DefaultHasher::new();
    task_id.hash(&mut hasher);
    agent_id.hash(&mut hasher);
    hasher.finish()
}

/// Default in-process scheduler: routes by capability, gates concurrency
/// with a role-bucket semaphore followed by a per-agent semaphore (acquired
/// in that order, everywhere, to avoid lock-order deadlock), and retries
/// with jittered exponential backoff.
pub struct InMemoryTaskScheduler {
    config: SchedulerConfig,
    registry: Arc<dyn AgentRegistry>,
    agents: Arc<DashMap<AgentId, Arc<dyn Agent>>>,
    time: Arc<dyn TimeProvider>,
    metrics: MetricsSink,
    tasks: DashMap<TaskId, Task>,
    idempotency: DashMap<IdempotencyKey, (TaskId, SystemTime)>,
    role_buckets: DashMap<String, Arc<Semaphore>>,
    bucket_capacity: DashMap<String, usize>,
    agent_loads: DashMap<AgentId, Arc<AgentLoad>>,
}

impl InMemoryTaskScheduler {
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<dyn AgentRegistry>,
        agents: Arc<DashMap<AgentId, Arc<dyn Agent>>>,
        time: Arc<dyn TimeProvider>,
        metrics: MetricsSink,
    ) -> Self {
        let role_buckets = DashMap::new();
        let bucket_capacity = DashMap::new();
        for (bucket, capacity) in &config.bucket_concurrency {
            let capacity = (*capacity).max(1);
            role_buckets.insert(bucket.clone(), Arc::new(Semaphore::new(capacity)));
            bucket_capacity.insert(bucket.clone(), capacity);
        }
        Self {
            config,
            registry,
            agents,
            time,
            metrics,
            tasks: DashMap::new(),
            idempotency: DashMap::new(),
            role_buckets,
            bucket_capacity,
            agent_loads: DashMap::new(),
        }
    }

    /// Resolves `capability` to its role bucket: the capability's own name if
    /// it matches a configured bucket, the shared `generic` bucket otherwise.
    /// Returns the bucket's name (for metric labelling) alongside its
    /// semaphore.
    fn bucket_for(&self, capability: &CapabilityName) -> (String, Arc<Semaphore>) {
        let key = capability.to_string();
        let bucket_name = if self.role_buckets.contains_key(&key) { key } else { "generic".to_string() };

        if let Some(existing) = self.role_buckets.get(&bucket_name) {
            return (bucket_name, existing.value().clone());
        }

        let capacity = self.config.bucket_concurrency.get(&bucket_name).copied().unwrap_or(16).max(1);
        self.bucket_capacity.insert(bucket_name.clone(), capacity);
        let semaphore = Arc::new(Semaphore::new(capacity));
        self.role_buckets.insert(bucket_name.clone(), semaphore.clone());
        (bucket_name, semaphore)
    }

    /// Reports the bucket's current in-flight permit count (capacity minus
    /// what's still available) under its role-bucket label.
    fn record_bucket_inflight(&self, bucket_name: &str, bucket: &Semaphore) {
        let capacity = self.bucket_capacity.get(bucket_name).map(|c| *c.value()).unwrap_or(1) as i64;
        let in_flight = capacity - bucket.available_permits() as i64;
        self.metrics.set_gauge("scheduler_inflight", vec![("bucket", bucket_name.to_string())], in_flight.max(0));
    }

    fn load_for(&self, agent_id: AgentId) -> Arc<AgentLoad> {
        self.agent_loads.entry(agent_id).or_insert_with(|| Arc::new(AgentLoad::default())).clone()
    }

    async fn select_agent(&self, capability: &CapabilityName, priority: Priority, task_id: TaskId) -> Option<AgentId> {
        let candidates = self.registry.find_by_capability(capability).await;
        let mut eligible = Vec::new();
        for entry in candidates {
            let eligible_status = if priority == Priority::Low {
                entry.status.eligible_for_low_priority_routing()
            } else {
                entry.status.eligible_for_normal_routing()
            };
            if !eligible_status {
                continue;
            }
            let load = self.load_for(entry.descriptor.agent_id);
            let in_flight = load.in_flight.load(Ordering::Relaxed);
            if in_flight >= u32::from(entry.descriptor.declared_limits.max_in_flight) {
                continue;
            }
            let failure_rate = load.failure_rate().await;
            eligible.push((entry.descriptor.agent_id, in_flight, failure_rate));
        }

        eligible.sort_by(|a, b| {
            a.1.cmp(&b.1)
                .then(a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
                .then(stable_hash(task_id, a.0).cmp(&stable_hash(task_id, b.0)))
        });

        eligible.first().map(|(agent_id, ..)| *agent_id)
    }

    async fn run_attempt(self: &Arc<Self>, task_id: TaskId) {
        let capability = match self.tasks.get(&task_id) {
            Some(task) => task.capability.clone(),
            None => return,
        };
        let priority = self.tasks.get(&task_id).map(|t| t.priority).unwrap_or(Priority::Normal);

        let deadline = self.tasks.get(&task_id).map(|t| t.deadline);
        let Some(deadline) = deadline else { return };

        loop {
            if self.time.now() >= deadline {
                self.finish(task_id, TaskState::Expired, None, Some("deadline elapsed before routing".into()));
                return;
            }

            let Some(agent_id) = self.select_agent(&capability, priority, task_id).await else {
                self.time.sleep(Duration::from_millis(200)).await;
                continue;
            };

            let (bucket_name, bucket) = self.bucket_for(&capability);
            let remaining = deadline.duration_since(self.time.now()).unwrap_or(Duration::ZERO);
            let admission_budget = Duration::from_millis(self.config.admission_budget_ms).min(remaining);

            let bucket_permit = match tokio::time::timeout(admission_budget, bucket.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                _ => {
                    self.metrics.incr_counter("bus_drops_total", vec![("reason", "scheduler_overloaded".to_string())]);
                    self.finish_retry_or_fail(task_id, "scheduler overloaded acquiring role bucket".into()).await;
                    return;
                }
            };

            let load = self.load_for(agent_id);
            load.in_flight.fetch_add(1, Ordering::Relaxed);

            self.set_state(task_id, TaskState::Routed);
            self.set_owner(task_id, agent_id);
            self.set_state(task_id, TaskState::Running);
            self.record_bucket_inflight(&bucket_name, &bucket);

            let Some(agent) = self.agents.get(&agent_id).map(|a| a.clone()) else {
                load.in_flight.fetch_sub(1, Ordering::Relaxed);
                drop(bucket_permit);
                self.record_bucket_inflight(&bucket_name, &bucket);
                self.set_state(task_id, TaskState::Pending);
                continue;
            };

            let task_snapshot = self.tasks.get(&task_id).map(|t| t.clone());
            let Some(task_snapshot) = task_snapshot else { return };
            let remaining = deadline.duration_since(self.time.now()).unwrap_or(Duration::ZERO);

            let outcome = tokio::time::timeout(remaining, agent.handle_task(&task_snapshot)).await;
            load.in_flight.fetch_sub(1, Ordering::Relaxed);
            drop(bucket_permit);
            self.record_bucket_inflight(&bucket_name, &bucket);

            match outcome {
                Err(_) => {
                    load.record(false).await;
                    self.finish(task_id, TaskState::Expired, None, Some("task execution exceeded deadline".into()));
                    return;
                }
                Ok(Err(core_error)) => {
                    load.record(false).await;
                    if core_error.kind().is_retryable() {
                        self.finish_retry_or_fail(task_id, core_error.to_string()).await;
                        if self.tasks.get(&task_id).is_some_and(|t| t.state == TaskState::Pending) {
                            continue;
                        }
                        return;
                    }
                    self.finish(task_id, TaskState::Failed, None, Some(core_error.to_string()));
                    return;
                }
                Ok(Ok(TaskOutcome::Succeeded { result })) => {
                    load.record(true).await;
                    self.finish(task_id, TaskState::Succeeded, Some(result), None);
                    return;
                }
                Ok(Ok(TaskOutcome::RetryableFailure { reason })) => {
                    load.record(false).await;
                    self.finish_retry_or_fail(task_id, reason).await;
                    if self.tasks.get(&task_id).is_some_and(|t| t.state == TaskState::Pending) {
                        continue;
                    }
                    return;
                }
                Ok(Ok(TaskOutcome::NonRetryableFailure { reason })) => {
                    load.record(false).await;
                    self.finish(task_id, TaskState::Failed, None, Some(reason));
                    return;
                }
                Ok(Ok(TaskOutcome::Cancelled)) => {
                    load.record(false).await;
                    self.finish(task_id, TaskState::Cancelled, None, None);
                    return;
                }
            }
        }
    }

    async fn finish_retry_or_fail(&self, task_id: TaskId, reason: String) {
        let should_retry = self.tasks.get_mut(&task_id).map(|mut task| {
            task.attempts += 1;
            task.last_error = Some(reason.clone());
            if task.attempts < u32::from(u8::from(task.max_attempts)) {
                let _ = task.transition(TaskState::Pending);
                true
            } else {
                let _ = task.transition(TaskState::Failed);
                false
            }
        });

        match should_retry {
            Some(true) => {
                let delay = self.tasks.get(&task_id).map(|task| {
                    let mut jitter = JitterSource::seeded(u64::from(task.attempts).wrapping_mul(2_654_435_761).max(1));
                    jittered_delay_ms(&task.backoff, task.attempts, jitter.next())
                });
                if let Some(delay) = delay {
                    self.time.sleep(Duration::from_millis(delay)).await;
                }
                self.metrics.incr_counter("tasks_total", vec![("capability", "*".to_string()), ("status", "retrying".to_string())]);
            }
            Some(false) => {
                warn!(%task_id, %reason, "task exhausted retries");
                self.metrics.incr_counter("tasks_total", vec![("capability", "*".to_string()), ("status", "failed".to_string())]);
            }
            None => {}
        }
    }

    fn set_state(&self, task_id: TaskId, state: TaskState) {
        if let Some(mut task) = self.tasks.get_mut(&task_id) {
            let _ = task.transition(state);
        }
    }

    fn set_owner(&self, task_id: TaskId, agent_id: AgentId) {
        if let Some(mut task) = self.tasks.get_mut(&task_id) {
            task.owner_agent = Some(agent_id);
        }
    }

    fn finish(&self, task_id: TaskId, state: TaskState, result: Option<serde_json::Value>, error: Option<String>) {
        if let Some(mut task) = self.tasks.get_mut(&task_id) {
            let _ = task.transition(state);
            task.result = result;
            task.last_error = error;
        }
        let capability = self.tasks.get(&task_id).map(|t| t.capability.to_string()).unwrap_or_default();
        info!(%task_id, ?state, "task finished");
        self.metrics.incr_counter("tasks_total", vec![("capability", capability), ("status", format!("{state:?}").to_lowercase())]);
    }
}

#[async_trait]
impl TaskScheduler for Arc<InMemoryTaskScheduler> {
    async fn submit(&self, spec: TaskSpec) -> Result<TaskId, SchedulerError> {
        if let Some(key) = &spec.idempotency_key {
            if let Some(entry) = self.idempotency.get(key) {
                let (existing_id, recorded_at) = *entry;
                let window = self.config.idempotency_window_for(&spec.capability.to_string());
                if self.time.now().duration_since(recorded_at).unwrap_or(Duration::ZERO) < window {
                    return Ok(existing_id);
                }
            }
        }

        let submitted_at = self.time.now();
        let deadline = spec.deadline.unwrap_or(submitted_at + Duration::from_millis(self.config.default_task_deadline_ms));
        let task_id = TaskId::generate();
        let max_attempts = spec.max_attempts.unwrap_or_default();

        let task = Task {
            task_id,
            idempotency_key: spec.idempotency_key.clone(),
            capability: spec.capability,
            payload: spec.payload,
            priority: spec.priority,
            submitted_at,
            deadline,
            attempts: 0,
            max_attempts,
            backoff: crate::domain::BackoffPolicy { base_ms: self.config.backoff_base_ms },
            state: TaskState::Pending,
            owner_agent: None,
            last_error: None,
            result: None,
        };

        self.tasks.insert(task_id, task);
        if let Some(key) = spec.idempotency_key {
            self.idempotency.insert(key, (task_id, submitted_at));
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_attempt(task_id).await;
        });

        Ok(task_id)
    }

    async fn cancel(&self, task_id: TaskId) -> Result<(), SchedulerError> {
        let mut task = self.tasks.get_mut(&task_id).ok_or(SchedulerError::NotFound(task_id))?;
        if task.state.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(task.state));
        }
        task.transition(TaskState::Cancelled).map_err(|_| SchedulerError::AlreadyTerminal(task.state))?;
        Ok(())
    }

    async fn status(&self, task_id: TaskId) -> Result<Task, SchedulerError> {
        self.tasks.get(&task_id).map(|t| t.clone()).ok_or(SchedulerError::NotFound(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::domain::{
        AgentDescriptor, AgentKind, AgentName, AgentStatus, DeclaredLimits, Envelope,
    };
    use crate::error::CoreError;
    use crate::registry::InMemoryAgentRegistry;
    use crate::time_provider::MockTimeProvider;
    use std::collections::HashSet;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn handle_envelope(&self, _envelope: Envelope) -> Result<Option<Envelope>, CoreError> {
            Ok(None)
        }

        async fn handle_task(&self, task: &Task) -> Result<TaskOutcome, CoreError> {
            Ok(TaskOutcome::Succeeded { result: task.payload.clone() })
        }
    }

    async fn setup() -> (Arc<InMemoryTaskScheduler>, Arc<InMemoryAgentRegistry>, AgentId, MetricsSink) {
        let registry = Arc::new(InMemoryAgentRegistry::new());
        let agents: Arc<DashMap<AgentId, Arc<dyn Agent>>> = Arc::new(DashMap::new());
        let time = Arc::new(MockTimeProvider::new());
        let metrics = MetricsSink::new();

        let mut capabilities = HashSet::new();
        capabilities.insert(CapabilityName::try_new("echo".to_string()).unwrap());
        let descriptor = AgentDescriptor {
            agent_id: AgentId::generate(),
            name: AgentName::try_new("echo".to_string()).unwrap(),
            kind: AgentKind::try_new("utility".to_string()).unwrap(),
            version: 1,
            capabilities,
            config: serde_json::json!({}),
            declared_limits: DeclaredLimits::default(),
        };
        let agent_id = descriptor.agent_id;
        registry.register(descriptor).await.unwrap();
        registry.transition(agent_id, AgentStatus::Ready, None).await.unwrap();
        agents.insert(agent_id, Arc::new(EchoAgent));

        let scheduler = Arc::new(InMemoryTaskScheduler::new(
            SchedulerConfig::default(),
            registry.clone(),
            agents,
            time,
            metrics.clone(),
        ));
        (scheduler, registry, agent_id, metrics)
    }

    #[tokio::test]
    async fn submit_routes_and_succeeds() {
        let (scheduler, _registry, _agent_id, _metrics) = setup().await;
        let task_id = scheduler
            .submit(TaskSpec {
                capability: CapabilityName::try_new("echo".to_string()).unwrap(),
                payload: serde_json::json!({"hello": "world"}),
                priority: Priority::Normal,
                deadline: None,
                idempotency_key: None,
                max_attempts: None,
            })
            .await
            .unwrap();

        for _ in 0..50 {
            let task = scheduler.status(task_id).await.unwrap();
            if task.state.is_terminal() {
                assert_eq!(task.state, TaskState::Succeeded);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never reached a terminal state");
    }

    #[tokio::test]
    async fn idempotency_key_returns_existing_task() {
        let (scheduler, _registry, _agent_id, _metrics) = setup().await;
        let key = IdempotencyKey::try_new("dup-1".to_string()).unwrap();
        let spec = || TaskSpec {
            capability: CapabilityName::try_new("echo".to_string()).unwrap(),
            payload: serde_json::json!({}),
            priority: Priority::Normal,
            deadline: None,
            idempotency_key: Some(key.clone()),
            max_attempts: None,
        };
        let first = scheduler.submit(spec()).await.unwrap();
        let second = scheduler.submit(spec()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cancel_on_unknown_task_errors() {
        let (scheduler, _registry, _agent_id, _metrics) = setup().await;
        let result = scheduler.cancel(TaskId::generate()).await;
        assert!(matches!(result, Err(SchedulerError::NotFound(_))));
    }
}

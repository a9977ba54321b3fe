//! End-to-end scenarios wiring the scheduler, registry, supervisor, LLM
//! gateway, and action gate together the way a deployed `mas-core` process
//! would, rather than exercising each subsystem's trait in isolation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mas_core::action_gate::{ActionContext, ActionGate, AuditStore};
use mas_core::agent_contract::Agent;
use mas_core::config::{
    ApprovalConfig, ActionCategoryKey, BusConfig, LlmConfig, ProviderConfig, RoutingPolicy,
    SchedulerConfig, SupervisorConfig,
};
use mas_core::domain::{
    ActionCategory, AgentDescriptor, AgentId, AgentKind, AgentName, AgentStatus, CapabilityName,
    CorrelationId, DeclaredLimits, Envelope, GenerationParams, HealthReport, LlmRequest, MaxInFlight,
    Message, Priority, ProviderErrorCategory, RoleTag, Task, TaskOutcome,
};
use mas_core::error::CoreError;
use mas_core::llm_gateway::{LlmGateway, MockProvider, Router};
use mas_core::metrics::MetricsSink;
use mas_core::registry::{AgentRegistry, InMemoryAgentRegistry};
use mas_core::scheduler::{InMemoryTaskScheduler, TaskScheduler, TaskSpec};
use mas_core::supervisor::Supervisor;
use mas_core::time_provider::integration_test_time_provider;

fn descriptor(name: &str, capability: &str, max_in_flight: u32) -> AgentDescriptor {
    let mut capabilities = HashSet::new();
    capabilities.insert(CapabilityName::try_new(capability.to_string()).unwrap());
    AgentDescriptor {
        agent_id: AgentId::generate(),
        name: AgentName::try_new(name.to_string()).unwrap(),
        kind: AgentKind::try_new("test".to_string()).unwrap(),
        version: 1,
        capabilities,
        config: serde_json::json!({}),
        declared_limits: DeclaredLimits { max_in_flight: MaxInFlight::try_new(max_in_flight).unwrap(), ..DeclaredLimits::default() },
    }
}

async fn ready(registry: &Arc<dyn AgentRegistry>, agent_id: AgentId) {
    registry.transition(agent_id, AgentStatus::Ready, None).await.unwrap();
}

/// Echoes its payload straight back as the task result.
struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn handle_envelope(&self, envelope: Envelope) -> Result<Option<Envelope>, CoreError> {
        Ok(Some(Envelope::response_to(&envelope, envelope.payload.clone())))
    }

    async fn handle_task(&self, task: &Task) -> Result<TaskOutcome, CoreError> {
        Ok(TaskOutcome::Succeeded { result: task.payload.clone() })
    }
}

/// Fails its first `fail_first` attempts with a retryable outcome, then succeeds.
struct FlakyThenSucceedsAgent {
    attempts: AtomicU32,
    fail_first: u32,
}

#[async_trait]
impl Agent for FlakyThenSucceedsAgent {
    async fn handle_envelope(&self, envelope: Envelope) -> Result<Option<Envelope>, CoreError> {
        Ok(Some(Envelope::response_to(&envelope, envelope.payload.clone())))
    }

    async fn handle_task(&self, task: &Task) -> Result<TaskOutcome, CoreError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Ok(TaskOutcome::RetryableFailure { reason: "transient".to_string() });
        }
        Ok(TaskOutcome::Succeeded { result: task.payload.clone() })
    }
}

/// Sleeps for `work_ms` per task, tracking the maximum number of concurrent
/// `handle_task` calls observed across every instance sharing `concurrent`.
struct SlowAgent {
    work_ms: u64,
    concurrent: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for SlowAgent {
    async fn handle_envelope(&self, envelope: Envelope) -> Result<Option<Envelope>, CoreError> {
        Ok(Some(Envelope::response_to(&envelope, envelope.payload.clone())))
    }

    async fn handle_task(&self, task: &Task) -> Result<TaskOutcome, CoreError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(self.work_ms)).await;
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(TaskOutcome::Succeeded { result: task.payload.clone() })
    }
}

/// Always reports itself unhealthy and raises on every envelope, used to
/// drive the supervisor's restart/quarantine policy.
struct AlwaysFailingAgent;

#[async_trait]
impl Agent for AlwaysFailingAgent {
    async fn health(&self) -> HealthReport {
        HealthReport::Failed { reason: "always down".to_string() }
    }

    async fn handle_envelope(&self, _envelope: Envelope) -> Result<Option<Envelope>, CoreError> {
        Err(CoreError::ProviderUnavailable("agent unreachable".to_string()))
    }

    async fn handle_task(&self, _task: &Task) -> Result<TaskOutcome, CoreError> {
        Err(CoreError::ProviderUnavailable("agent unreachable".to_string()))
    }
}

/// Scenario 1: happy path routing. A single `echo`-capable agent succeeds
/// on first attempt and the result payload is passed through unchanged.
#[tokio::test]
async fn happy_path_routing_echoes_payload() {
    let metrics = MetricsSink::new();
    let registry: Arc<dyn AgentRegistry> = Arc::new(InMemoryAgentRegistry::new());
    let agents: Arc<DashMap<AgentId, Arc<dyn Agent>>> = Arc::new(DashMap::new());
    let time = integration_test_time_provider();

    let descriptor = descriptor("A1", "echo", 4);
    let agent_id = descriptor.agent_id;
    registry.register(descriptor).await.unwrap();
    ready(&registry, agent_id).await;
    agents.insert(agent_id, Arc::new(EchoAgent));

    let scheduler = Arc::new(InMemoryTaskScheduler::new(
        SchedulerConfig::default(),
        registry.clone(),
        agents.clone(),
        time.clone(),
        metrics.clone(),
    ));

    let task_id = scheduler
        .submit(TaskSpec {
            capability: CapabilityName::try_new("echo".to_string()).unwrap(),
            payload: serde_json::json!({"payload": "hi"}),
            priority: Priority::Normal,
            deadline: None,
            idempotency_key: None,
            max_attempts: None,
        })
        .await
        .unwrap();

    let task = poll_until_terminal(&scheduler, task_id).await;
    assert!(matches!(task.state, mas_core::domain::TaskState::Succeeded));
    assert_eq!(task.result.unwrap()["payload"], "hi");

    let rendered = metrics.render();
    assert!(rendered.contains("tasks_total{capability=\"echo\",status=\"succeeded\"} 1"));
}

/// Scenario 2: retry then success. The agent fails its first attempt
/// retryably and succeeds on the second, with backoff observed between them.
#[tokio::test]
async fn retry_then_success_backs_off_between_attempts() {
    let metrics = MetricsSink::new();
    let registry: Arc<dyn AgentRegistry> = Arc::new(InMemoryAgentRegistry::new());
    let agents: Arc<DashMap<AgentId, Arc<dyn Agent>>> = Arc::new(DashMap::new());
    let time = integration_test_time_provider();

    let descriptor = descriptor("A2", "flaky", 4);
    let agent_id = descriptor.agent_id;
    registry.register(descriptor).await.unwrap();
    ready(&registry, agent_id).await;
    agents.insert(agent_id, Arc::new(FlakyThenSucceedsAgent { attempts: AtomicU32::new(0), fail_first: 1 }));

    let mut config = SchedulerConfig::default();
    config.max_attempts = 3;
    config.backoff_base_ms = 10;

    let scheduler = Arc::new(InMemoryTaskScheduler::new(config, registry.clone(), agents.clone(), time.clone(), metrics.clone()));

    let started = std::time::Instant::now();
    let task_id = scheduler
        .submit(TaskSpec {
            capability: CapabilityName::try_new("flaky".to_string()).unwrap(),
            payload: serde_json::json!({}),
            priority: Priority::Normal,
            deadline: None,
            idempotency_key: None,
            max_attempts: None,
        })
        .await
        .unwrap();

    let task = poll_until_terminal(&scheduler, task_id).await;
    let elapsed = started.elapsed();

    assert!(matches!(task.state, mas_core::domain::TaskState::Succeeded));
    assert_eq!(task.attempts, 2);
    assert!(elapsed >= Duration::from_millis(10), "backoff between attempts was shorter than configured: {elapsed:?}");
}

/// Scenario 3: capacity backpressure. Two agents each declare
/// `max_in_flight = 1`; ten tasks submitted in a burst never run more than
/// two concurrently, and all ten eventually succeed.
#[tokio::test]
async fn capacity_backpressure_caps_concurrency() {
    let metrics = MetricsSink::new();
    let registry: Arc<dyn AgentRegistry> = Arc::new(InMemoryAgentRegistry::new());
    let agents: Arc<DashMap<AgentId, Arc<dyn Agent>>> = Arc::new(DashMap::new());
    let time = integration_test_time_provider();

    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for name in ["B1", "B2"] {
        let descriptor = descriptor(name, "flaky", 1);
        let agent_id = descriptor.agent_id;
        registry.register(descriptor).await.unwrap();
        ready(&registry, agent_id).await;
        agents.insert(agent_id, Arc::new(SlowAgent { work_ms: 100, concurrent: concurrent.clone(), peak: peak.clone() }));
    }

    let scheduler = Arc::new(InMemoryTaskScheduler::new(SchedulerConfig::default(), registry.clone(), agents.clone(), time.clone(), metrics.clone()));

    let mut task_ids = Vec::new();
    for _ in 0..10 {
        let task_id = scheduler
            .submit(TaskSpec {
                capability: CapabilityName::try_new("flaky".to_string()).unwrap(),
                payload: serde_json::json!({}),
                priority: Priority::Normal,
                deadline: None,
                idempotency_key: None,
                max_attempts: None,
            })
            .await
            .unwrap();
        task_ids.push(task_id);
    }

    for task_id in task_ids {
        let task = poll_until_terminal(&scheduler, task_id).await;
        assert!(matches!(task.state, mas_core::domain::TaskState::Succeeded));
    }

    assert!(peak.load(Ordering::SeqCst) <= 2, "observed more than 2 tasks running concurrently");
}

/// Scenario 4: supervisor restart. An agent raises on every probe; the
/// supervisor moves it `Ready -> Degraded -> Quarantined` and stops
/// restarting it once quarantined.
#[tokio::test]
async fn repeated_failures_quarantine_the_agent() {
    let metrics = MetricsSink::new();
    let registry: Arc<dyn AgentRegistry> = Arc::new(InMemoryAgentRegistry::new());
    let bus: Arc<dyn mas_core::bus::MessageBus> =
        Arc::new(mas_core::bus::InMemoryMessageBus::new(BusConfig::default(), metrics.clone()));
    let agents: Arc<DashMap<AgentId, Arc<dyn Agent>>> = Arc::new(DashMap::new());
    let time = integration_test_time_provider();

    let descriptor = descriptor("A3", "echo", 4);
    let agent_id = descriptor.agent_id;
    registry.register(descriptor).await.unwrap();
    ready(&registry, agent_id).await;
    agents.insert(agent_id, Arc::new(AlwaysFailingAgent));

    let mut config = SupervisorConfig::default();
    config.consecutive_failures_to_quarantine = 3;
    config.max_restart_attempts = 1;
    config.probe_interval_ms = 10;
    config.probe_timeout_ms = 5;
    config.restart_window_ms = 60_000;

    let supervisor = Arc::new(Supervisor::new(config, registry.clone(), bus.clone(), agents.clone(), time.clone(), metrics.clone()));
    supervisor.register_factory(agent_id, Arc::new(|| Arc::new(AlwaysFailingAgent) as Arc<dyn Agent>));

    let probe_loop = tokio::spawn(supervisor.clone().run());

    let mut status = AgentStatus::Initializing;
    for _ in 0..200 {
        status = registry.get(agent_id).await.unwrap().status;
        if status == AgentStatus::Quarantined {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    supervisor.request_shutdown();
    probe_loop.abort();

    assert_eq!(status, AgentStatus::Quarantined);
}

/// Scenario 5: LLM fallback. The primary provider reports a rate limit; the
/// gateway falls through its chain and returns the backup's response.
#[tokio::test]
async fn llm_gateway_falls_back_past_rate_limited_provider() {
    let mut config = LlmConfig { policy: RoutingPolicy::ByRole, ..LlmConfig::default() };
    config.providers.insert(
        "p1".into(),
        ProviderConfig { kind: "mock".into(), base_url: None, model_aliases: std::collections::HashMap::new(), cost_per_1k_tokens: 0.0, latency_class: "fast".into() },
    );
    config.providers.insert(
        "p2".into(),
        ProviderConfig { kind: "mock".into(), base_url: None, model_aliases: std::collections::HashMap::new(), cost_per_1k_tokens: 0.0, latency_class: "fast".into() },
    );
    config.fallback_chain = vec!["p1".into(), "p2".into()];

    let mut providers: std::collections::HashMap<String, Arc<dyn mas_core::llm_gateway::LlmProvider>> = std::collections::HashMap::new();
    providers.insert("p1".into(), Arc::new(MockProvider::failing("p1", ProviderErrorCategory::RateLimit)));
    providers.insert("p2".into(), Arc::new(MockProvider::new("p2")));

    let metrics = MetricsSink::new();
    let gateway: Arc<dyn LlmGateway> = Arc::new(Router::new(config, providers, metrics.clone()));

    let response = gateway
        .invoke(LlmRequest {
            role_tag: RoleTag::Fast,
            messages: vec![Message { role: "user".to_string(), content: "hi".to_string() }],
            tools: None,
            params: GenerationParams::default(),
        })
        .await
        .unwrap();

    assert_eq!(response.provider, "p2");

    let rendered = metrics.render();
    assert!(rendered.contains("llm_calls_total{model=\"n/a\",provider=\"p1\",status=\"error\"} 1"));
    assert!(rendered.contains("llm_calls_total{model=\"n/a\",provider=\"p2\",status=\"ok\"} 1"));
}

/// Scenario 6: approval gate. A `risky` action blocks until an approver
/// resolves it, then executes exactly once.
#[tokio::test]
async fn risky_action_waits_for_approval_then_executes_once() {
    let audit = Arc::new(mas_core::action_gate::InMemoryAuditStore::new());
    let metrics = MetricsSink::new();
    let config = ApprovalConfig { approval_required_for: vec![ActionCategoryKey::Risky], approval_timeout_ms: 5_000 };
    let gate = Arc::new(ActionGate::new(config, audit.clone() as Arc<dyn mas_core::action_gate::AuditStore>, metrics));

    let correlation_id = CorrelationId::generate();
    let executions = Arc::new(AtomicI64::new(0));

    let gate_clone = gate.clone();
    let executions_clone = executions.clone();
    let handle = tokio::spawn(async move {
        gate_clone
            .execute(
                ActionContext {
                    correlation_id,
                    agent_id: None,
                    task_id: None,
                    action_type: "delete_database".to_string(),
                    category: ActionCategory::Risky,
                    inputs_redacted: serde_json::json!({}),
                },
                || async move {
                    executions_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!({"ok": true}))
                },
            )
            .await
    });

    let action_id = loop {
        let pending = audit.list_by_correlation(correlation_id).await;
        if let Some(record) = pending.into_iter().next() {
            break record.action_id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    assert!(gate.resolve_approval(action_id, true));

    let result = handle.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let history = audit.list_by_correlation(correlation_id).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, mas_core::domain::ActionStatus::Executed);
}

async fn poll_until_terminal(scheduler: &Arc<InMemoryTaskScheduler>, task_id: mas_core::domain::TaskId) -> Task {
    for _ in 0..500 {
        let task = scheduler.status(task_id).await.unwrap();
        if task.state.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {task_id} did not reach a terminal state in time");
}

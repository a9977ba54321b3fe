//! Composition root: wires every subsystem from one [`CoreConfig`] into a
//! [`CoreRuntime`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::action_gate::ActionGate;
use crate::agent_contract::Agent;
use crate::bus::{InMemoryMessageBus, MessageBus};
use crate::config::{CoreConfig, LlmConfig};
use crate::control_plane::{AppState, SharedState};
use crate::domain::AgentId;
use crate::llm_gateway::{HttpChatProvider, LlmGateway, LlmProvider, MockProvider, Router};
use crate::memory::{InMemoryMemory, Memory, SharedMemory};
use crate::metrics::MetricsSink;
use crate::registry::{AgentRegistry, InMemoryAgentRegistry, RegistryError};
use crate::scheduler::InMemoryTaskScheduler;
use crate::stores::{AgentCatalogStore, SqlitePersistence, StoreError};
use crate::supervisor::Supervisor;
use crate::time_provider::{production_time_provider, SharedTimeProvider};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Every subsystem, already wired together. Held for the process lifetime;
/// `mas-core`'s `main` owns one, `masctl` never constructs one (it only
/// speaks the control-plane HTTP API).
pub struct CoreRuntime {
    pub config: CoreConfig,
    pub metrics: MetricsSink,
    pub store: Arc<SqlitePersistence>,
    pub registry: Arc<dyn AgentRegistry>,
    pub bus: Arc<dyn MessageBus>,
    pub agents: Arc<DashMap<AgentId, Arc<dyn Agent>>>,
    pub scheduler: Arc<InMemoryTaskScheduler>,
    pub supervisor: Arc<Supervisor>,
    pub llm_gateway: Arc<dyn LlmGateway>,
    pub action_gate: Arc<ActionGate>,
    pub memory: SharedMemory,
    pub time: SharedTimeProvider,
    ready: Arc<AtomicBool>,
}

impl CoreRuntime {
    /// Builds every subsystem from `config`. The agent catalog persisted in
    /// the relational store is replayed into the in-memory registry before
    /// returning, so a restart rediscovers every previously-registered
    /// agent (re-entering `Initializing`; the supervisor's probe loop moves
    /// it on from there once it starts responding to health checks).
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Store`] if the SQLite pool cannot be opened
    /// or the schema cannot be created, or [`RuntimeError::Registry`] if a
    /// persisted descriptor fails to replay (never expected in practice,
    /// since the store only ever holds descriptors the registry itself
    /// validated on the way in).
    pub async fn build(config: CoreConfig) -> Result<Self, RuntimeError> {
        let metrics = MetricsSink::new();
        let time = production_time_provider();

        let store = Arc::new(SqlitePersistence::connect(&config.storage.database_url).await?);

        let registry: Arc<dyn AgentRegistry> = Arc::new(InMemoryAgentRegistry::new());
        let catalog = store.load_all().await?;
        let restored = catalog.len();
        for descriptor in catalog {
            registry.register(descriptor).await?;
        }
        if restored > 0 {
            info!(restored, "replayed persisted agent catalog into registry");
        }

        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new(config.bus.clone(), metrics.clone()));
        let agents: Arc<DashMap<AgentId, Arc<dyn Agent>>> = Arc::new(DashMap::new());

        let scheduler = Arc::new(InMemoryTaskScheduler::new(
            config.scheduler.clone(),
            registry.clone(),
            agents.clone(),
            time.clone(),
            metrics.clone(),
        ));

        let supervisor = Arc::new(Supervisor::new(
            config.supervisor.clone(),
            registry.clone(),
            bus.clone(),
            agents.clone(),
            time.clone(),
            metrics.clone(),
        ));

        let providers = build_providers(&config.llm);
        let llm_gateway: Arc<dyn LlmGateway> =
            Arc::new(Router::new(config.llm.clone(), providers, metrics.clone()));

        let action_gate = Arc::new(ActionGate::new(
            config.approval.clone(),
            store.clone() as Arc<dyn crate::action_gate::AuditStore>,
            metrics.clone(),
        ));

        let memory: SharedMemory = Arc::new(InMemoryMemory::new(config.memory.clone()));

        Ok(Self {
            config,
            metrics,
            store,
            registry,
            bus,
            agents,
            scheduler,
            supervisor,
            llm_gateway,
            action_gate,
            memory,
            time,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Assembles the control-plane's shared state from this runtime's
    /// already-constructed subsystems.
    #[must_use]
    pub fn app_state(&self) -> SharedState {
        Arc::new(AppState {
            registry: self.registry.clone(),
            scheduler: self.scheduler.clone(),
            bus: self.bus.clone(),
            llm_gateway: self.llm_gateway.clone(),
            action_gate: self.action_gate.clone(),
            memory: self.memory.clone(),
            feedback: self.store.clone() as Arc<dyn crate::stores::FeedbackStore>,
            metrics: self.metrics.clone(),
            started_at: SystemTime::now(),
            ready: self.ready.clone(),
        })
    }

    /// Flips `/ready` to report healthy. Called once startup probes (the
    /// store connection, at minimum) have succeeded.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    /// Drains the supervisor's fleet and stops admitting new work. Does not
    /// itself stop the HTTP listener; the caller drives that via the same
    /// `CancellationToken` passed to `axum::serve`'s graceful shutdown.
    pub async fn shutdown(&self) {
        self.supervisor.graceful_shutdown().await;
    }
}

fn api_key_env_var(provider_name: &str) -> String {
    format!("MAS_CORE_LLM_{}_API_KEY", provider_name.to_uppercase())
}

/// Builds one adapter per configured provider. A provider with `kind =
/// "mock"` or no `base_url` gets the deterministic [`MockProvider`] (useful
/// for local development and the seed scenarios); anything else gets the
/// OpenAI-shaped [`HttpChatProvider`], with credentials read from
/// `MAS_CORE_LLM_{NAME}_API_KEY` rather than the config file so a sanitized
/// config snapshot never needs to redact them.
fn build_providers(config: &LlmConfig) -> HashMap<String, Arc<dyn LlmProvider>> {
    let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
    for (name, provider_config) in &config.providers {
        let provider: Arc<dyn LlmProvider> = match (&provider_config.kind[..], &provider_config.base_url) {
            ("mock", _) | (_, None) => Arc::new(MockProvider::new(name.clone())),
            (_, Some(base_url)) => {
                let api_key = std::env::var(api_key_env_var(name)).unwrap_or_else(|_| {
                    warn!(provider = %name, "no API key in environment, calls will fail auth");
                    String::new()
                });
                let model = provider_config
                    .model_aliases
                    .get("default")
                    .cloned()
                    .unwrap_or_else(|| name.clone());
                Arc::new(HttpChatProvider::new(name.clone(), base_url.clone(), api_key, model))
            }
        };
        providers.insert(name.clone(), provider);
    }
    providers
}

//! Layered configuration: defaults → file → environment.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable prefix used for config overrides, with `__` as the
/// nesting separator, e.g. `MAS_CORE__SCHEDULER__MAX_ATTEMPTS=5`.
pub const ENV_PREFIX: &str = "MAS_CORE__";

/// A fixed token substituted for any secret value before logging a config snapshot.
pub const REDACTION_TOKEN: &str = "[redacted]";

/// Errors produced while loading or validating configuration. All validation
/// problems are aggregated into one `Invalid` so operators see every problem
/// in a single pass rather than failing on the first one found.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, #[source] source: toml::de::Error },

    #[error("invalid configuration:\n{}", .problems.join("\n"))]
    Invalid { problems: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub mailbox_capacity: usize,
    pub pubsub_subscriber_buffer: usize,
    pub send_backpressure_budget_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { mailbox_capacity: 1_000, pubsub_subscriber_buffer: 256, send_backpressure_budget_ms: 2_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub default_task_deadline_ms: u64,
    pub max_attempts: u8,
    pub backoff_base_ms: u64,
    pub bucket_concurrency: HashMap<String, usize>,
    pub admission_budget_ms: u64,
    pub idempotency_window: HashMap<String, u64>,
    pub default_idempotency_window_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let mut bucket_concurrency = HashMap::new();
        bucket_concurrency.insert("generic".to_string(), 16);
        bucket_concurrency.insert("stt".to_string(), 4);
        bucket_concurrency.insert("llm".to_string(), 8);
        bucket_concurrency.insert("tts".to_string(), 4);
        Self {
            default_task_deadline_ms: 30_000,
            max_attempts: 3,
            backoff_base_ms: 200,
            bucket_concurrency,
            admission_budget_ms: 5_000,
            idempotency_window: HashMap::new(),
            default_idempotency_window_ms: 60_000,
        }
    }
}

impl SchedulerConfig {
    /// Looks up the idempotency window for a capability, falling back to the default.
    #[must_use]
    pub fn idempotency_window_for(&self, capability: &str) -> Duration {
        Duration::from_millis(
            *self
                .idempotency_window
                .get(capability)
                .unwrap_or(&self.default_idempotency_window_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub max_restart_attempts: u32,
    pub restart_window_ms: u64,
    pub consecutive_failures_to_quarantine: u32,
    pub drain_deadline_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5_000,
            probe_timeout_ms: 2_000,
            max_restart_attempts: 3,
            restart_window_ms: 60_000,
            consecutive_failures_to_quarantine: 3,
            drain_deadline_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: String,
    pub base_url: Option<String>,
    pub model_aliases: HashMap<String, String>,
    pub cost_per_1k_tokens: f64,
    pub latency_class: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingPolicy {
    ByRole,
    ByCost,
    ByLatency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub role_map: HashMap<String, String>,
    pub policy: RoutingPolicy,
    pub fallback_chain: Vec<String>,
    pub rate_limit_cooldown_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            role_map: HashMap::new(),
            policy: RoutingPolicy::ByRole,
            fallback_chain: Vec::new(),
            rate_limit_cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionCategoryKey {
    Read,
    Write,
    External,
    Risky,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    pub approval_required_for: Vec<ActionCategoryKey>,
    pub approval_timeout_ms: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { approval_required_for: vec![ActionCategoryKey::Risky], approval_timeout_ms: 120_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub session_ttl_ms: u64,
    pub working_ttl_ms: u64,
    pub profile_ttl_ms: Option<u64>,
    pub vector_search_threshold: f32,
    pub vector_top_k: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            session_ttl_ms: 1_800_000,
            working_ttl_ms: 600_000,
            profile_ttl_ms: None,
            vector_search_threshold: 0.75,
            vector_top_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub redaction_patterns: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "json".to_string(), redaction_patterns: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1:8080".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { database_url: "sqlite://mas-core.db?mode=rwc".to_string() }
    }
}

/// The immutable, validated configuration every subsystem is constructed from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CoreConfig {
    /// Loads defaults, merges an optional TOML file, then applies
    /// `MAS_CORE__`-prefixed environment overrides, and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`]/[`ConfigError::Parse`] if the file cannot
    /// be read or parsed, or [`ConfigError::Invalid`] if validation fails.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = file {
            let text = std::fs::read_to_string(path)
                .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
            config = toml::from_str(&text)
                .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })?;
        }

        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Aggregates every schema violation into one error, rather than
    /// stopping at the first problem.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.bus.mailbox_capacity == 0 {
            problems.push("bus.mailbox_capacity must be > 0".to_string());
        }
        if self.scheduler.max_attempts == 0 {
            problems.push("scheduler.max_attempts must be > 0".to_string());
        }
        if self.scheduler.bucket_concurrency.is_empty() {
            problems.push("scheduler.bucket_concurrency must declare at least one bucket".to_string());
        }
        if self.supervisor.probe_interval_ms == 0 {
            problems.push("supervisor.probe_interval_ms must be > 0".to_string());
        }
        if self.supervisor.probe_timeout_ms >= self.supervisor.probe_interval_ms {
            problems.push("supervisor.probe_timeout_ms must be less than probe_interval_ms".to_string());
        }
        for name in &self.llm.fallback_chain {
            if !self.llm.providers.contains_key(name) {
                problems.push(format!("llm.fallback_chain references unknown provider '{name}'"));
            }
        }
        if self.memory.vector_search_threshold < 0.0 || self.memory.vector_search_threshold > 1.0 {
            problems.push("memory.vector_search_threshold must be in [0, 1]".to_string());
        }
        if self.logging.format != "json" && self.logging.format != "text" {
            problems.push("logging.format must be 'json' or 'text'".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// A sanitized view suitable for logging at startup: provider base URLs
    /// and any field named as a redaction pattern are replaced with
    /// [`REDACTION_TOKEN`].
    #[must_use]
    pub fn sanitized_snapshot(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        redact_in_place(&mut value, &self.logging.redaction_patterns);
        value
    }
}

fn redact_in_place(value: &mut serde_json::Value, patterns: &[String]) {
    if let serde_json::Value::Object(map) = value {
        for (key, v) in map.iter_mut() {
            if patterns.iter().any(|p| key.to_lowercase().contains(&p.to_lowercase()))
                || key.to_lowercase().contains("secret")
                || key.to_lowercase().contains("api_key")
                || key.to_lowercase().contains("token")
                || key.to_lowercase().contains("password")
            {
                *v = serde_json::Value::String(REDACTION_TOKEN.to_string());
            } else {
                redact_in_place(v, patterns);
            }
        }
    } else if let serde_json::Value::Array(items) = value {
        for item in items {
            redact_in_place(item, patterns);
        }
    }
}

/// Applies `MAS_CORE__SECTION__FIELD=value` environment overrides onto a
/// deserialized config by round-tripping through a JSON value, so overrides
/// work uniformly across every nested section without hand-written setters.
fn apply_env_overrides(config: &mut CoreConfig) {
    let mut value = serde_json::to_value(&*config).expect("CoreConfig always serializes");
    for (key, raw) in std::env::vars() {
        let Some(path) = key.strip_prefix(ENV_PREFIX) else { continue };
        let segments: Vec<String> = path.split("__").map(|s| s.to_lowercase()).collect();
        set_path(&mut value, &segments, &raw);
    }
    if let Ok(updated) = serde_json::from_value(value) {
        *config = updated;
    }
}

fn set_path(value: &mut serde_json::Value, segments: &[String], raw: &str) {
    let Some((head, rest)) = segments.split_first() else { return };
    if !value.is_object() {
        *value = serde_json::Value::Object(serde_json::Map::new());
    }
    let map = value.as_object_mut().expect("just ensured object");
    if rest.is_empty() {
        map.insert(head.clone(), parse_scalar(raw));
    } else {
        let entry = map.entry(head.clone()).or_insert(serde_json::Value::Object(serde_json::Map::new()));
        set_path(entry, rest, raw);
    }
}

fn parse_scalar(raw: &str) -> serde_json::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return serde_json::Value::Bool(b);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return serde_json::Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    serde_json::Value::String(raw.to_string())
}

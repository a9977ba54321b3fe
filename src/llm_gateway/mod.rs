//! The LLM Gateway: one contract over heterogeneous providers, with
//! policy-based routing and a fallback chain.

pub mod provider;
pub mod router;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::LlmConfig;
use crate::domain::{LlmRequest, LlmResponse, ProviderErrorCategory, StreamEvent};
use crate::metrics::MetricsSink;

pub use provider::{HttpChatProvider, LlmProvider, MockProvider, ProviderError};

/// Failures `invoke`/`invoke_streaming` can report.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no provider configured for this role")]
    NoProviderForRole,

    #[error("every provider in the fallback chain is unavailable")]
    AllProvidersExhausted,
}

#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn invoke(&self, request: LlmRequest) -> Result<LlmResponse, GatewayError>;

    async fn invoke_streaming(&self, request: LlmRequest) -> Result<mpsc::Receiver<StreamEvent>, GatewayError>;

    async fn embed(&self, provider_hint: Option<&str>, text: &str) -> Result<Vec<f32>, GatewayError>;
}

/// The production gateway: holds one adapter per configured provider and
/// walks [`router::candidate_order`] on every call, skipping providers
/// currently in a rate-limit cool-down.
pub struct Router {
    config: LlmConfig,
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    cooldowns: DashMap<String, SystemTime>,
    metrics: MetricsSink,
}

impl Router {
    #[must_use]
    pub fn new(config: LlmConfig, providers: HashMap<String, Arc<dyn LlmProvider>>, metrics: MetricsSink) -> Self {
        Self { config, providers, cooldowns: DashMap::new(), metrics }
    }

    fn is_cooling_down(&self, name: &str) -> bool {
        self.cooldowns.get(name).is_some_and(|until| SystemTime::now() < *until)
    }

    fn start_cooldown(&self, name: &str) {
        self.cooldowns.insert(name.to_string(), SystemTime::now() + Duration::from_millis(self.config.rate_limit_cooldown_ms));
    }

    fn candidates(&self, request: &LlmRequest) -> Vec<Arc<dyn LlmProvider>> {
        router::candidate_order(&self.config, &request.role_tag)
            .into_iter()
            .filter(|name| !self.is_cooling_down(name))
            .filter_map(|name| self.providers.get(&name).cloned())
            .collect()
    }

    fn record(&self, provider: &str, status: &str) {
        self.metrics.incr_counter("llm_calls_total", vec![("provider", provider.to_string()), ("model", "n/a".to_string()), ("status", status.to_string())]);
    }
}

#[async_trait]
impl LlmGateway for Router {
    async fn invoke(&self, request: LlmRequest) -> Result<LlmResponse, GatewayError> {
        let candidates = self.candidates(&request);
        if candidates.is_empty() {
            return Err(GatewayError::NoProviderForRole);
        }

        for provider in candidates {
            match provider.complete(&request).await {
                Ok(response) => {
                    self.record(provider.name(), "ok");
                    self.metrics.add_counter(
                        "llm_tokens_total",
                        vec![("provider", provider.name().to_string()), ("model", response.model.clone()), ("type", "prompt".to_string())],
                        u64::from(response.usage.prompt_tokens),
                    );
                    self.metrics.add_counter(
                        "llm_tokens_total",
                        vec![("provider", provider.name().to_string()), ("model", response.model.clone()), ("type", "completion".to_string())],
                        u64::from(response.usage.completion_tokens),
                    );
                    self.metrics.observe_histogram(
                        "llm_call_duration_seconds",
                        vec![("provider", provider.name().to_string()), ("model", response.model.clone())],
                        response.usage.latency_ms as f64 / 1000.0,
                    );
                    return Ok(response);
                }
                Err(err) => {
                    warn!(provider = provider.name(), category = ?err.category, "provider call failed");
                    self.record(provider.name(), "error");
                    if err.category == ProviderErrorCategory::RateLimit {
                        self.start_cooldown(provider.name());
                    }
                }
            }
        }

        Err(GatewayError::AllProvidersExhausted)
    }

    async fn invoke_streaming(&self, request: LlmRequest) -> Result<mpsc::Receiver<StreamEvent>, GatewayError> {
        let candidates = self.candidates(&request);
        for provider in candidates {
            match provider.stream_complete(&request).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    self.record(provider.name(), "error");
                    if err.category == ProviderErrorCategory::RateLimit {
                        self.start_cooldown(provider.name());
                    }
                }
            }
        }
        Err(GatewayError::AllProvidersExhausted)
    }

    async fn embed(&self, provider_hint: Option<&str>, text: &str) -> Result<Vec<f32>, GatewayError> {
        let candidates: Vec<Arc<dyn LlmProvider>> = if let Some(hint) = provider_hint {
            self.providers.get(hint).cloned().into_iter().collect()
        } else {
            self.providers.values().cloned().collect()
        };

        for provider in candidates {
            if let Ok(vector) = provider.embed(text).await {
                return Ok(vector);
            }
        }
        Err(GatewayError::AllProvidersExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, RoutingPolicy};
    use crate::domain::{GenerationParams, Message, RoleTag};

    fn request() -> LlmRequest {
        LlmRequest { role_tag: RoleTag::Fast, messages: vec![Message { role: "user".into(), content: "hi".into() }], tools: None, params: GenerationParams::default() }
    }

    #[tokio::test]
    async fn falls_back_when_primary_rate_limited() {
        let mut config = LlmConfig { policy: RoutingPolicy::ByRole, ..LlmConfig::default() };
        config.providers.insert("primary".into(), ProviderConfig { kind: "mock".into(), base_url: None, model_aliases: HashMap::new(), cost_per_1k_tokens: 0.0, latency_class: "fast".into() });
        config.providers.insert("backup".into(), ProviderConfig { kind: "mock".into(), base_url: None, model_aliases: HashMap::new(), cost_per_1k_tokens: 0.0, latency_class: "fast".into() });
        config.fallback_chain = vec!["primary".into(), "backup".into()];

        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert("primary".into(), Arc::new(MockProvider::failing("primary", ProviderErrorCategory::RateLimit)));
        providers.insert("backup".into(), Arc::new(MockProvider::new("backup")));

        let router = Router::new(config, providers, MetricsSink::new());
        let response = router.invoke(request()).await.unwrap();
        assert_eq!(response.provider, "backup");
    }

    #[tokio::test]
    async fn exhausting_every_provider_is_reported() {
        let mut config = LlmConfig::default();
        config.providers.insert("only".into(), ProviderConfig { kind: "mock".into(), base_url: None, model_aliases: HashMap::new(), cost_per_1k_tokens: 0.0, latency_class: "fast".into() });
        config.fallback_chain = vec!["only".into()];

        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert("only".into(), Arc::new(MockProvider::failing("only", ProviderErrorCategory::Server)));

        let router = Router::new(config, providers, MetricsSink::new());
        let result = router.invoke(request()).await;
        assert!(matches!(result, Err(GatewayError::AllProvidersExhausted)));
    }
}

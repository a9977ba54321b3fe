//! The per-provider adapter contract.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{LlmRequest, LlmResponse, ProviderErrorCategory, StreamEvent, Usage};

/// A failed provider call. Carries whatever usage was measured before the
/// failure — the gateway never discards partial accounting.
#[derive(Debug, Error)]
#[error("provider error ({category:?}): {message}")]
pub struct ProviderError {
    pub category: ProviderErrorCategory,
    pub message: String,
    pub partial_usage: Option<Usage>,
}

/// Implemented once per upstream LLM vendor. Every adapter exposes the same
/// four operations regardless of the vendor's own API shape.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// The provider name used in config (`llm.providers` keys, `llm.fallback_chain`).
    fn name(&self) -> &str;

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError>;

    async fn stream_complete(&self, request: &LlmRequest) -> Result<mpsc::Receiver<StreamEvent>, ProviderError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// `complete` with tool use forced; adapters that don't distinguish the
    /// two simply delegate.
    async fn tool_call(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        self.complete(request).await
    }
}

/// A deterministic provider used by tests and local development, reusable as
/// a `generic` fallback when no real credentials are configured.
pub struct MockProvider {
    name: String,
    pub fail_with: Option<ProviderErrorCategory>,
}

impl MockProvider {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), fail_with: None }
    }

    #[must_use]
    pub fn failing(name: impl Into<String>, category: ProviderErrorCategory) -> Self {
        Self { name: name.into(), fail_with: Some(category) }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        if let Some(category) = self.fail_with {
            return Err(ProviderError { category, message: "mock failure".into(), partial_usage: None });
        }
        let echoed = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(LlmResponse {
            output: crate::domain::LlmOutput::Text(echoed),
            usage: Usage { prompt_tokens: 8, completion_tokens: 8, latency_ms: 5 },
            provider: self.name.clone(),
            model: "mock-1".to_string(),
        })
    }

    async fn stream_complete(&self, request: &LlmRequest) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        let (tx, rx) = mpsc::channel(8);
        let content = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        let usage = Usage { prompt_tokens: 8, completion_tokens: 8, latency_ms: 5 };
        tokio::spawn(async move {
            let _ = tx.send(StreamEvent::Delta(content)).await;
            let _ = tx.send(StreamEvent::Usage(usage)).await;
        });
        Ok(rx)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if let Some(category) = self.fail_with {
            return Err(ProviderError { category, message: "mock failure".into(), partial_usage: None });
        }
        Ok(vec![text.len() as f32, 0.0, 0.0])
    }
}

/// An HTTP-backed adapter for OpenAI-compatible chat-completion APIs
/// (OpenAI, and any provider exposing the same wire shape).
pub struct HttpChatProvider {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl HttpChatProvider {
    #[must_use]
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self { name: name.into(), base_url: base_url.into(), api_key: api_key.into(), model: model.into(), client: reqwest::Client::new() }
    }

    fn classify(status: reqwest::StatusCode) -> ProviderErrorCategory {
        match status.as_u16() {
            401 | 403 => ProviderErrorCategory::Auth,
            429 => ProviderErrorCategory::RateLimit,
            408 => ProviderErrorCategory::Timeout,
            400..=499 => ProviderErrorCategory::Client,
            500..=599 => ProviderErrorCategory::Server,
            _ => ProviderErrorCategory::Unknown,
        }
    }
}

#[async_trait]
impl LlmProvider for HttpChatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let started = std::time::Instant::now();
        let body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.params.temperature,
            "max_tokens": request.params.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError {
                category: if err.is_timeout() { ProviderErrorCategory::Timeout } else { ProviderErrorCategory::Server },
                message: err.to_string(),
                partial_usage: None,
            })?;

        if !response.status().is_success() {
            return Err(ProviderError { category: Self::classify(response.status()), message: response.status().to_string(), partial_usage: None });
        }

        let parsed: serde_json::Value = response.json().await.map_err(|err| ProviderError {
            category: ProviderErrorCategory::Unknown,
            message: err.to_string(),
            partial_usage: None,
        })?;

        let text = parsed["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_string();
        let usage = Usage {
            prompt_tokens: parsed["usage"]["prompt_tokens"].as_u64().unwrap_or_default() as u32,
            completion_tokens: parsed["usage"]["completion_tokens"].as_u64().unwrap_or_default() as u32,
            latency_ms: started.elapsed().as_millis() as u64,
        };

        Ok(LlmResponse { output: crate::domain::LlmOutput::Text(text), usage, provider: self.name.clone(), model: self.model.clone() })
    }

    async fn stream_complete(&self, _request: &LlmRequest) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        Err(ProviderError { category: ProviderErrorCategory::Unknown, message: "streaming not implemented for this adapter".into(), partial_usage: None })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|err| ProviderError { category: ProviderErrorCategory::Server, message: err.to_string(), partial_usage: None })?;

        if !response.status().is_success() {
            return Err(ProviderError { category: Self::classify(response.status()), message: response.status().to_string(), partial_usage: None });
        }

        let parsed: serde_json::Value = response.json().await.map_err(|err| ProviderError {
            category: ProviderErrorCategory::Unknown,
            message: err.to_string(),
            partial_usage: None,
        })?;
        let embedding = parsed["data"][0]["embedding"]
            .as_array()
            .map(|values| values.iter().filter_map(serde_json::Value::as_f64).map(|v| v as f32).collect())
            .unwrap_or_default();
        Ok(embedding)
    }
}

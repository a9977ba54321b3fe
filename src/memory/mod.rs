//! Memory subsystem: a narrow, layered store agents reach through one API

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::MemoryConfig;
use crate::domain::{MemoryItem, MemoryLayer, OwnerScope, SearchHit};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("no item found for key {0}")]
    NotFound(String),

    #[error("memory read failed: {0}")]
    BackendFailure(String),
}

/// What a `search` call is matching against.
pub enum MemoryQuery {
    Embedding(Vec<f32>),
    TimeRange { since: SystemTime, until: SystemTime },
}

/// What a `forget` call clears.
pub enum ForgetTarget {
    Key(String),
    Scope(OwnerScope),
}

#[async_trait]
pub trait Memory: Send + Sync {
    /// Best-effort write; failures are logged, never returned to the caller
    /// Writes are best-effort.
    async fn put(&self, item: MemoryItem);

    /// Reads a single item. Degrades to `Ok(None)` on a backend failure
    /// unless `strict` is set, in which case the failure surfaces.
    async fn get(&self, layer: MemoryLayer, owner: &OwnerScope, key: &str, strict: bool) -> Result<Option<serde_json::Value>, MemoryError>;

    /// Ranks stored items for `owner` in `layer` against `query`, returning
    /// at most `k` hits above the configured similarity threshold (for
    /// embedding queries) or within range (for time-range queries).
    async fn search(&self, layer: MemoryLayer, owner: &OwnerScope, query: MemoryQuery, k: usize) -> Vec<SearchHit>;

    /// Clears one key or an entire owner scope within `layer`.
    async fn forget(&self, layer: MemoryLayer, target: ForgetTarget);
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

struct StoredItem {
    item: MemoryItem,
    stored_at: SystemTime,
}

impl StoredItem {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.item.ttl.is_some_and(|ttl| now.duration_since(self.stored_at).unwrap_or(Duration::ZERO) > ttl)
    }
}

type LayerKey = (MemoryLayer, OwnerScope, String);

/// In-process memory backing the `ephemeral`/`session`/`working`/`semantic`/
/// `profile` layers; `episodic` additionally keeps an append-only ordered
/// list per owner since it has no single `key` identity.
pub struct InMemoryMemory {
    config: MemoryConfig,
    items: DashMap<LayerKey, StoredItem>,
    episodic: Mutex<HashMap<OwnerScope, Vec<StoredItem>>>,
}

impl InMemoryMemory {
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self { config, items: DashMap::new(), episodic: Mutex::new(HashMap::new()) }
    }

    fn ttl_for(&self, layer: MemoryLayer) -> Option<Duration> {
        match layer {
            MemoryLayer::Session => Some(Duration::from_millis(self.config.session_ttl_ms)),
            MemoryLayer::Working => Some(Duration::from_millis(self.config.working_ttl_ms)),
            MemoryLayer::Profile => self.config.profile_ttl_ms.map(Duration::from_millis),
            MemoryLayer::Ephemeral | MemoryLayer::Semantic | MemoryLayer::Episodic => None,
        }
    }
}

#[async_trait]
impl Memory for InMemoryMemory {
    async fn put(&self, mut item: MemoryItem) {
        if item.ttl.is_none() {
            item.ttl = self.ttl_for(item.layer);
        }

        if item.layer == MemoryLayer::Episodic {
            let mut episodic = self.episodic.lock().await;
            episodic.entry(item.owner_scope.clone()).or_default().push(StoredItem { item, stored_at: SystemTime::now() });
            return;
        }

        let key = (item.layer, item.owner_scope.clone(), item.key.clone());
        self.items.insert(key, StoredItem { item, stored_at: SystemTime::now() });
    }

    async fn get(&self, layer: MemoryLayer, owner: &OwnerScope, key: &str, strict: bool) -> Result<Option<serde_json::Value>, MemoryError> {
        let lookup_key = (layer, owner.clone(), key.to_string());
        match self.items.get(&lookup_key) {
            Some(entry) if !entry.is_expired(SystemTime::now()) => Ok(Some(entry.item.value.clone())),
            Some(_) => Ok(None),
            None => {
                if strict {
                    Err(MemoryError::NotFound(key.to_string()))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn search(&self, layer: MemoryLayer, owner: &OwnerScope, query: MemoryQuery, k: usize) -> Vec<SearchHit> {
        match (layer, query) {
            (MemoryLayer::Episodic, MemoryQuery::TimeRange { since, until }) => {
                let episodic = self.episodic.lock().await;
                let Some(entries) = episodic.get(owner) else { return Vec::new() };
                entries
                    .iter()
                    .filter(|stored| stored.stored_at >= since && stored.stored_at <= until)
                    .take(k)
                    .map(|stored| SearchHit { key: stored.item.key.clone(), value: stored.item.value.clone(), score: 1.0 })
                    .collect()
            }
            (_, MemoryQuery::Embedding(query_vector)) => {
                let threshold = self.config.vector_search_threshold;
                let mut hits: Vec<SearchHit> = self
                    .items
                    .iter()
                    .filter(|entry| entry.key().0 == layer && entry.key().1 == *owner)
                    .filter_map(|entry| {
                        let embedding = entry.value().item.embedding.as_ref()?;
                        let score = cosine_similarity(&query_vector, embedding);
                        (score >= threshold).then(|| SearchHit { key: entry.value().item.key.clone(), value: entry.value().item.value.clone(), score })
                    })
                    .collect();
                hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                hits.truncate(k);
                hits
            }
            _ => {
                warn!("unsupported memory query shape for this layer");
                Vec::new()
            }
        }
    }

    async fn forget(&self, layer: MemoryLayer, target: ForgetTarget) {
        match target {
            ForgetTarget::Key(key) => {
                let keys_to_remove: Vec<LayerKey> = self.items.iter().map(|e| e.key().clone()).filter(|(l, _, k)| *l == layer && *k == key).collect();
                for k in keys_to_remove {
                    self.items.remove(&k);
                }
            }
            ForgetTarget::Scope(scope) => {
                if layer == MemoryLayer::Episodic {
                    self.episodic.lock().await.remove(&scope);
                    return;
                }
                let keys_to_remove: Vec<LayerKey> = self.items.iter().map(|e| e.key().clone()).filter(|(l, s, _)| *l == layer && *s == scope).collect();
                for k in keys_to_remove {
                    self.items.remove(&k);
                }
            }
        }
    }
}

/// Convenience wrapper matching the narrow surface the rest of the core
/// depends on, so composition code can pass around one trait object.
pub type SharedMemory = Arc<dyn Memory>;

#[cfg(test)]
mod tests {
    use super::*;

    fn item(layer: MemoryLayer, owner: OwnerScope, key: &str, value: serde_json::Value) -> MemoryItem {
        MemoryItem { layer, key: key.to_string(), value, ttl: None, embedding: None, owner_scope: owner }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let memory = InMemoryMemory::new(MemoryConfig::default());
        let owner = OwnerScope::Session("s1".into());
        memory.put(item(MemoryLayer::Session, owner.clone(), "greeting", serde_json::json!("hi"))).await;
        let value = memory.get(MemoryLayer::Session, &owner, "greeting", false).await.unwrap();
        assert_eq!(value, Some(serde_json::json!("hi")));
    }

    #[tokio::test]
    async fn missing_key_degrades_to_none_unless_strict() {
        let memory = InMemoryMemory::new(MemoryConfig::default());
        let owner = OwnerScope::Session("s1".into());
        assert_eq!(memory.get(MemoryLayer::Session, &owner, "nope", false).await.unwrap(), None);
        assert!(memory.get(MemoryLayer::Session, &owner, "nope", true).await.is_err());
    }

    #[tokio::test]
    async fn semantic_search_filters_by_threshold() {
        let memory = InMemoryMemory::new(MemoryConfig { vector_search_threshold: 0.9, ..MemoryConfig::default() });
        let owner = OwnerScope::Agent("a1".into());
        let mut close = item(MemoryLayer::Semantic, owner.clone(), "close", serde_json::json!("close"));
        close.embedding = Some(vec![1.0, 0.0]);
        let mut far = item(MemoryLayer::Semantic, owner.clone(), "far", serde_json::json!("far"));
        far.embedding = Some(vec![0.0, 1.0]);
        memory.put(close).await;
        memory.put(far).await;

        let hits = memory.search(MemoryLayer::Semantic, &owner, MemoryQuery::Embedding(vec![1.0, 0.0]), 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "close");
    }

    #[tokio::test]
    async fn forget_scope_clears_every_key() {
        let memory = InMemoryMemory::new(MemoryConfig::default());
        let owner = OwnerScope::Session("s1".into());
        memory.put(item(MemoryLayer::Session, owner.clone(), "a", serde_json::json!(1))).await;
        memory.put(item(MemoryLayer::Session, owner.clone(), "b", serde_json::json!(2))).await;
        memory.forget(MemoryLayer::Session, ForgetTarget::Scope(owner.clone())).await;
        assert_eq!(memory.get(MemoryLayer::Session, &owner, "a", false).await.unwrap(), None);
    }
}

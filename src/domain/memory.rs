//! Memory subsystem item shapes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The six memory layers, each with its own lifecycle policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryLayer {
    Ephemeral,
    Session,
    Working,
    Semantic,
    Episodic,
    Profile,
}

/// Identifies whose memory a given item belongs to (a session, task, user, or agent).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerScope {
    Session(String),
    Task(String),
    User(String),
    Agent(String),
    Global,
}

/// A single stored memory item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub layer: MemoryLayer,
    pub key: String,
    pub value: serde_json::Value,
    pub ttl: Option<Duration>,
    pub embedding: Option<Vec<f32>>,
    pub owner_scope: OwnerScope,
}

/// A semantic-search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub key: String,
    pub value: serde_json::Value,
    pub score: f32,
}

//! Contracts for the relational store collaborator: agent metadata, audit
//! logs, feedback. The core depends only on these traits;
//! [`sqlite_store`] is the one concrete adapter it ships.

pub mod sqlite_store;

pub use sqlite_store::SqlitePersistence;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{AgentDescriptor, AgentId, FeedbackRecord, FeedbackSummary};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(String),
}

/// Durable persistence for [`AgentDescriptor`]s, so the registry's catalog
/// survives a process restart.
#[async_trait]
pub trait AgentCatalogStore: Send + Sync {
    async fn save(&self, descriptor: &AgentDescriptor) -> Result<(), StoreError>;
    async fn load_all(&self) -> Result<Vec<AgentDescriptor>, StoreError>;
    async fn delete(&self, agent_id: AgentId) -> Result<(), StoreError>;
}

/// Durable persistence for feedback signals and their aggregates.
/// Summaries bucket by `agent_id`.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn insert(&self, record: FeedbackRecord) -> Result<(), StoreError>;
    async fn recent(&self, limit: u32) -> Result<Vec<FeedbackRecord>, StoreError>;
    async fn summary_global(&self) -> Result<FeedbackSummary, StoreError>;
    async fn summary_for_agent(&self, agent_id: AgentId) -> Result<FeedbackSummary, StoreError>;
}

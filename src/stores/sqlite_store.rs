//! `SQLite`-backed persistence for the audit trail, feedback signals, and
//! the agent catalog.
//!
//! Follows the functional core / imperative shell split: [`sql`] and
//! [`mapping`] are pure, [`SqlitePersistence`]'s methods are the only place
//! that touches the pool.

use std::collections::HashSet;
use std::time::SystemTime;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::action_gate::AuditStore;
use crate::domain::{
    ActionCategory, ActionId, ActionRecord, ActionStatus, AgentDescriptor, AgentId, AgentKind,
    AgentName, CapabilityName, CorrelationId, DeclaredLimits, FeedbackId, FeedbackRecord,
    FeedbackSummary, Rating, TaskId,
};

use super::{AgentCatalogStore, FeedbackStore, StoreError};

mod sql {
    pub(super) fn create_actions_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS actions (
            action_id TEXT PRIMARY KEY,
            correlation_id TEXT NOT NULL,
            agent_id TEXT,
            task_id TEXT,
            action_type TEXT NOT NULL,
            category TEXT NOT NULL,
            inputs_redacted TEXT NOT NULL,
            outputs_redacted TEXT,
            status TEXT NOT NULL,
            approver TEXT,
            created_at INTEGER NOT NULL,
            executed_at INTEGER,
            duration_ms INTEGER,
            error TEXT
        )"
    }

    pub(super) fn upsert_action() -> &'static str {
        "INSERT OR REPLACE INTO actions
            (action_id, correlation_id, agent_id, task_id, action_type, category,
             inputs_redacted, outputs_redacted, status, approver, created_at,
             executed_at, duration_ms, error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    }

    pub(super) fn select_action_by_id() -> &'static str {
        "SELECT * FROM actions WHERE action_id = ?"
    }

    pub(super) fn select_actions_by_correlation() -> &'static str {
        "SELECT * FROM actions WHERE correlation_id = ? ORDER BY created_at ASC"
    }

    pub(super) fn create_feedback_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS feedback (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            agent_id TEXT,
            rating INTEGER NOT NULL,
            success INTEGER NOT NULL,
            notes TEXT,
            created_at INTEGER NOT NULL
        )"
    }

    pub(super) fn insert_feedback() -> &'static str {
        "INSERT INTO feedback (id, conversation_id, agent_id, rating, success, notes, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)"
    }

    pub(super) fn select_all_feedback() -> &'static str {
        "SELECT rating, success FROM feedback"
    }

    pub(super) fn select_feedback_for_agent() -> &'static str {
        "SELECT rating, success FROM feedback WHERE agent_id = ?"
    }

    pub(super) fn select_recent_feedback() -> &'static str {
        "SELECT * FROM feedback ORDER BY created_at DESC LIMIT ?"
    }

    pub(super) fn create_agents_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS agent_catalog (
            agent_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            version INTEGER NOT NULL,
            capabilities TEXT NOT NULL,
            config TEXT NOT NULL,
            max_in_flight INTEGER NOT NULL,
            queue_depth INTEGER NOT NULL,
            base_timeout_ms INTEGER NOT NULL
        )"
    }

    pub(super) fn upsert_agent() -> &'static str {
        "INSERT OR REPLACE INTO agent_catalog
            (agent_id, name, kind, version, capabilities, config,
             max_in_flight, queue_depth, base_timeout_ms)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
    }

    pub(super) fn select_all_agents() -> &'static str {
        "SELECT * FROM agent_catalog"
    }

    pub(super) fn delete_agent() -> &'static str {
        "DELETE FROM agent_catalog WHERE agent_id = ?"
    }
}

mod mapping {
    use super::{ActionCategory, ActionStatus};

    pub(super) fn category_to_str(category: ActionCategory) -> &'static str {
        match category {
            ActionCategory::Read => "read",
            ActionCategory::Write => "write",
            ActionCategory::External => "external",
            ActionCategory::Risky => "risky",
        }
    }

    pub(super) fn category_from_str(s: &str) -> ActionCategory {
        match s {
            "write" => ActionCategory::Write,
            "external" => ActionCategory::External,
            "risky" => ActionCategory::Risky,
            _ => ActionCategory::Read,
        }
    }

    pub(super) fn status_to_str(status: ActionStatus) -> &'static str {
        match status {
            ActionStatus::Pending => "pending",
            ActionStatus::Approved => "approved",
            ActionStatus::Rejected => "rejected",
            ActionStatus::Executed => "executed",
            ActionStatus::Failed => "failed",
        }
    }

    pub(super) fn status_from_str(s: &str) -> ActionStatus {
        match s {
            "approved" => ActionStatus::Approved,
            "rejected" => ActionStatus::Rejected,
            "executed" => ActionStatus::Executed,
            "failed" => ActionStatus::Failed,
            _ => ActionStatus::Pending,
        }
    }

    pub(super) fn millis_to_system_time(millis: i64) -> std::time::SystemTime {
        let millis = u64::try_from(millis).unwrap_or(0);
        std::time::UNIX_EPOCH + std::time::Duration::from_millis(millis)
    }

    pub(super) fn system_time_to_millis(t: std::time::SystemTime) -> i64 {
        t.duration_since(std::time::UNIX_EPOCH).map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX)).unwrap_or(0)
    }
}

fn row_to_action(row: &sqlx::sqlite::SqliteRow) -> Result<ActionRecord, StoreError> {
    let action_id: String = row.try_get("action_id")?;
    let correlation_id: String = row.try_get("correlation_id")?;
    let agent_id: Option<String> = row.try_get("agent_id")?;
    let task_id: Option<String> = row.try_get("task_id")?;
    let category: String = row.try_get("category")?;
    let status: String = row.try_get("status")?;
    let inputs_redacted: String = row.try_get("inputs_redacted")?;
    let outputs_redacted: Option<String> = row.try_get("outputs_redacted")?;
    let created_at: i64 = row.try_get("created_at")?;
    let executed_at: Option<i64> = row.try_get("executed_at")?;

    Ok(ActionRecord {
        action_id: ActionId::parse(&action_id).map_err(|e| StoreError::Migration(e.to_string()))?,
        correlation_id: CorrelationId::parse(&correlation_id).map_err(|e| StoreError::Migration(e.to_string()))?,
        agent_id: agent_id.and_then(|s| AgentId::parse(&s).ok()),
        task_id: task_id.and_then(|s| TaskId::parse(&s).ok()),
        action_type: row.try_get("action_type")?,
        category: mapping::category_from_str(&category),
        inputs_redacted: serde_json::from_str(&inputs_redacted).unwrap_or(serde_json::Value::Null),
        outputs_redacted: outputs_redacted.and_then(|s| serde_json::from_str(&s).ok()),
        status: mapping::status_from_str(&status),
        approver: row.try_get("approver")?,
        created_at: mapping::millis_to_system_time(created_at),
        executed_at: executed_at.map(mapping::millis_to_system_time),
        duration_ms: row.try_get::<Option<i64>, _>("duration_ms")?.map(|v| v as u64),
        error: row.try_get("error")?,
    })
}

fn row_to_feedback(row: &sqlx::sqlite::SqliteRow) -> Option<FeedbackRecord> {
    let id: String = row.try_get("id").ok()?;
    let agent_id: Option<String> = row.try_get("agent_id").ok()?;
    let rating: i64 = row.try_get("rating").ok()?;
    let created_at: i64 = row.try_get("created_at").ok()?;
    Some(FeedbackRecord {
        id: FeedbackId::parse(&id).ok()?,
        conversation_id: row.try_get("conversation_id").ok()?,
        agent_id: agent_id.and_then(|s| AgentId::parse(&s).ok()),
        rating: Rating::try_new(u8::try_from(rating).ok()?).ok()?,
        success: row.try_get("success").ok()?,
        notes: row.try_get("notes").ok()?,
        created_at: mapping::millis_to_system_time(created_at),
    })
}

/// Durable backing store for audit records, feedback, and the agent catalog,
/// all sharing one `SQLite` pool.
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Connects to `database_url` (e.g. `sqlite://mas-core.db`) and ensures
    /// every table this store owns exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the connection or schema setup fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(sql::create_actions_table()).execute(&self.pool).await?;
        sqlx::query(sql::create_feedback_table()).execute(&self.pool).await?;
        sqlx::query(sql::create_agents_table()).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for SqlitePersistence {
    async fn insert(&self, record: ActionRecord) {
        self.update(record).await;
    }

    async fn update(&self, record: ActionRecord) {
        let result = sqlx::query(sql::upsert_action())
            .bind(record.action_id.to_string())
            .bind(record.correlation_id.to_string())
            .bind(record.agent_id.map(|id| id.to_string()))
            .bind(record.task_id.map(|id| id.to_string()))
            .bind(&record.action_type)
            .bind(mapping::category_to_str(record.category))
            .bind(record.inputs_redacted.to_string())
            .bind(record.outputs_redacted.as_ref().map(ToString::to_string))
            .bind(mapping::status_to_str(record.status))
            .bind(&record.approver)
            .bind(mapping::system_time_to_millis(record.created_at))
            .bind(record.executed_at.map(mapping::system_time_to_millis))
            .bind(record.duration_ms.map(|v| v as i64))
            .bind(&record.error)
            .execute(&self.pool)
            .await;

        if let Err(error) = result {
            tracing::warn!(%error, "failed to persist audit record");
        }
    }

    async fn get(&self, action_id: ActionId) -> Option<ActionRecord> {
        let row = sqlx::query(sql::select_action_by_id()).bind(action_id.to_string()).fetch_optional(&self.pool).await.ok().flatten()?;
        row_to_action(&row).ok()
    }

    async fn list_by_correlation(&self, correlation_id: CorrelationId) -> Vec<ActionRecord> {
        let Ok(rows) = sqlx::query(sql::select_actions_by_correlation()).bind(correlation_id.to_string()).fetch_all(&self.pool).await else {
            return Vec::new();
        };
        rows.iter().filter_map(|row| row_to_action(row).ok()).collect()
    }
}

#[async_trait]
impl FeedbackStore for SqlitePersistence {
    async fn insert(&self, record: FeedbackRecord) -> Result<(), StoreError> {
        sqlx::query(sql::insert_feedback())
            .bind(record.id.to_string())
            .bind(&record.conversation_id)
            .bind(record.agent_id.map(|id| id.to_string()))
            .bind(i64::from(record.rating.into_inner()))
            .bind(record.success)
            .bind(&record.notes)
            .bind(mapping::system_time_to_millis(record.created_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent(&self, limit: u32) -> Result<Vec<FeedbackRecord>, StoreError> {
        let rows = sqlx::query(sql::select_recent_feedback()).bind(i64::from(limit)).fetch_all(&self.pool).await?;
        Ok(rows.iter().filter_map(row_to_feedback).collect())
    }

    async fn summary_global(&self) -> Result<FeedbackSummary, StoreError> {
        let rows = sqlx::query(sql::select_all_feedback()).fetch_all(&self.pool).await?;
        Ok(summarize(&rows))
    }

    async fn summary_for_agent(&self, agent_id: AgentId) -> Result<FeedbackSummary, StoreError> {
        let rows = sqlx::query(sql::select_feedback_for_agent()).bind(agent_id.to_string()).fetch_all(&self.pool).await?;
        Ok(summarize(&rows))
    }
}

fn summarize(rows: &[sqlx::sqlite::SqliteRow]) -> FeedbackSummary {
    let count = rows.len() as u64;
    if count == 0 {
        return FeedbackSummary { count: 0, average_rating: 0.0, success_rate: 0.0 };
    }
    let rating_sum: i64 = rows.iter().map(|r| r.get::<i64, _>("rating")).sum();
    let success_count = rows.iter().filter(|r| r.get::<bool, _>("success")).count() as u64;
    FeedbackSummary { count, average_rating: rating_sum as f64 / count as f64, success_rate: success_count as f64 / count as f64 }
}

#[async_trait]
impl AgentCatalogStore for SqlitePersistence {
    async fn save(&self, descriptor: &AgentDescriptor) -> Result<(), StoreError> {
        let capabilities: Vec<String> = descriptor.capabilities.iter().map(ToString::to_string).collect();
        sqlx::query(sql::upsert_agent())
            .bind(descriptor.agent_id.to_string())
            .bind(descriptor.name.to_string())
            .bind(descriptor.kind.to_string())
            .bind(i64::try_from(descriptor.version).unwrap_or(i64::MAX))
            .bind(serde_json::to_string(&capabilities).unwrap_or_default())
            .bind(descriptor.config.to_string())
            .bind(i64::from(u32::from(descriptor.declared_limits.max_in_flight)))
            .bind(i64::try_from(usize::from(descriptor.declared_limits.queue_depth)).unwrap_or(i64::MAX))
            .bind(i64::try_from(u64::from(descriptor.declared_limits.base_timeout_ms)).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AgentDescriptor>, StoreError> {
        let rows = sqlx::query(sql::select_all_agents()).fetch_all(&self.pool).await?;
        let mut descriptors = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(descriptor) = row_to_descriptor(row) {
                descriptors.push(descriptor);
            }
        }
        Ok(descriptors)
    }

    async fn delete(&self, agent_id: AgentId) -> Result<(), StoreError> {
        sqlx::query(sql::delete_agent()).bind(agent_id.to_string()).execute(&self.pool).await?;
        Ok(())
    }
}

fn row_to_descriptor(row: &sqlx::sqlite::SqliteRow) -> Option<AgentDescriptor> {
    let agent_id: String = row.try_get("agent_id").ok()?;
    let name: String = row.try_get("name").ok()?;
    let kind: String = row.try_get("kind").ok()?;
    let version: i64 = row.try_get("version").ok()?;
    let capabilities: String = row.try_get("capabilities").ok()?;
    let config: String = row.try_get("config").ok()?;
    let max_in_flight: i64 = row.try_get("max_in_flight").ok()?;
    let queue_depth: i64 = row.try_get("queue_depth").ok()?;
    let base_timeout_ms: i64 = row.try_get("base_timeout_ms").ok()?;

    let capability_names: HashSet<CapabilityName> =
        serde_json::from_str::<Vec<String>>(&capabilities).ok()?.into_iter().filter_map(|s| CapabilityName::try_new(s).ok()).collect();

    Some(AgentDescriptor {
        agent_id: AgentId::parse(&agent_id).ok()?,
        name: AgentName::try_new(name).ok()?,
        kind: AgentKind::try_new(kind).ok()?,
        version: u64::try_from(version).ok()?,
        capabilities: capability_names,
        config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
        declared_limits: DeclaredLimits {
            max_in_flight: crate::domain::MaxInFlight::try_new(u32::try_from(max_in_flight).ok()?).ok()?,
            queue_depth: crate::domain::QueueDepth::try_new(usize::try_from(queue_depth).ok()?).ok()?,
            base_timeout_ms: crate::domain::BaseTimeoutMs::try_new(u64::try_from(base_timeout_ms).ok()?).ok()?,
        },
    })
}

//! Append-only feedback signal.

use std::time::SystemTime;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use super::ids::{AgentId, FeedbackId};

/// A 1-5 star rating.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 5),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct Rating(u8);

/// One piece of user/operator feedback about a conversation or agent run.
///
/// Append-only: resolves the "adjust the system prompt" vs. "append-only"
/// tension in favor of append-only —
/// any learning loop is a consumer of [`FeedbackSummary`], never a mutator
/// of this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: FeedbackId,
    pub conversation_id: String,
    pub agent_id: Option<AgentId>,
    pub rating: Rating,
    pub success: bool,
    pub notes: Option<String>,
    pub created_at: SystemTime,
}

/// Aggregate view over a set of [`FeedbackRecord`]s.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub count: u64,
    pub average_rating: f64,
    pub success_rate: f64,
}

impl FeedbackSummary {
    /// Computes a summary from a slice of records; `count == 0` yields zeros
    /// rather than dividing by zero.
    #[must_use]
    pub fn from_records(records: &[FeedbackRecord]) -> Self {
        let count = records.len() as u64;
        if count == 0 {
            return Self { count: 0, average_rating: 0.0, success_rate: 0.0 };
        }
        let rating_sum: u64 = records.iter().map(|r| u64::from(r.rating.into_inner())).sum();
        let success_count = records.iter().filter(|r| r.success).count() as u64;
        Self {
            count,
            average_rating: rating_sum as f64 / count as f64,
            success_rate: success_count as f64 / count as f64,
        }
    }
}

//! Bus envelopes.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::ids::{AgentId, CorrelationId, EnvelopeId};

/// Discriminates the three envelope shapes the bus carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Request,
    Response,
    Event,
}

/// The unit of message delivery on the bus.
///
/// Invariant: a `Response` envelope must carry `in_reply_to` equal to the
/// originating `Request`'s [`EnvelopeId`]; the bus enforces this on `send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub envelope_id: EnvelopeId,
    pub from: AgentId,
    pub to: AgentId,
    pub kind: EnvelopeKind,
    pub correlation_id: CorrelationId,
    pub in_reply_to: Option<EnvelopeId>,
    pub created_at: SystemTime,
    pub deadline: Option<SystemTime>,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
}

impl Envelope {
    /// Builds a `Request` envelope with a fresh id and correlation id.
    #[must_use]
    pub fn request(
        from: AgentId,
        to: AgentId,
        payload: serde_json::Value,
        deadline: Option<SystemTime>,
    ) -> Self {
        Self {
            envelope_id: EnvelopeId::generate(),
            from,
            to,
            kind: EnvelopeKind::Request,
            correlation_id: CorrelationId::generate(),
            in_reply_to: None,
            created_at: SystemTime::now(),
            deadline,
            payload,
            headers: HashMap::new(),
        }
    }

    /// Builds a `Response` envelope replying to `request`, preserving its
    /// correlation id and swapping sender/recipient.
    #[must_use]
    pub fn response_to(request: &Envelope, payload: serde_json::Value) -> Self {
        Self {
            envelope_id: EnvelopeId::generate(),
            from: request.to,
            to: request.from,
            kind: EnvelopeKind::Response,
            correlation_id: request.correlation_id,
            in_reply_to: Some(request.envelope_id),
            created_at: SystemTime::now(),
            deadline: None,
            payload,
            headers: HashMap::new(),
        }
    }

    /// Whether this envelope has a satisfied invariant between `kind` and `in_reply_to`.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        match self.kind {
            EnvelopeKind::Response => self.in_reply_to.is_some(),
            EnvelopeKind::Request | EnvelopeKind::Event => true,
        }
    }

    /// Whether `deadline` has already elapsed as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// Event the bus emits back to a sender when an envelope's deadline elapses
/// before delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlineExceeded {
    pub envelope_id: EnvelopeId,
    pub correlation_id: CorrelationId,
}

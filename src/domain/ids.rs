//! Strongly-typed identifiers shared across every subsystem.
//!
//! Every identifier is a `nutype`-wrapped `Uuid` so an `AgentId` can never be
//! accidentally compared against a `TaskId`, matching the newtype discipline
//! used throughout the rest of the domain layer.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[nutype(derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            Serialize,
            Deserialize,
            Display,
            From,
            Into
        ))]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self::new(Uuid::new_v4())
            }

            /// Parses an identifier from its string form.
            ///
            /// # Errors
            ///
            /// Returns an error if `s` is not a valid UUID.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self::new(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(AgentId, "Identifies a registered agent.");
uuid_id!(EnvelopeId, "Identifies a single bus envelope.");
uuid_id!(CorrelationId, "Threads one logical operation across every subsystem.");
uuid_id!(TaskId, "Identifies a scheduled task.");
uuid_id!(ActionId, "Identifies an audited action.");
uuid_id!(FeedbackId, "Identifies a feedback record.");
uuid_id!(NodeId, "Identifies a cluster node (reserved for distributed deployments).");

impl CorrelationId {
    /// Adopts an externally supplied correlation id (e.g. from an inbound
    /// `Correlation-Id` header) or mints a fresh one if the caller has none.
    #[must_use]
    pub fn adopt_or_generate(existing: Option<&str>) -> Self {
        existing
            .and_then(|s| Self::parse(s).ok())
            .unwrap_or_else(Self::generate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_id_types_do_not_collide() {
        let agent = AgentId::generate();
        let task = TaskId::generate();
        assert_ne!(agent.to_string(), "");
        assert_ne!(task.to_string(), "");
    }

    #[test]
    fn correlation_id_adopts_valid_header() {
        let id = CorrelationId::generate();
        let adopted = CorrelationId::adopt_or_generate(Some(&id.to_string()));
        assert_eq!(id, adopted);
    }

    #[test]
    fn correlation_id_generates_on_garbage_header() {
        let adopted = CorrelationId::adopt_or_generate(Some("not-a-uuid"));
        assert!(CorrelationId::parse(&adopted.to_string()).is_ok());
    }
}

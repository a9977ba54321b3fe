//! Agent descriptors and lifecycle status.

use std::collections::HashSet;
use std::time::SystemTime;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use super::ids::AgentId;

/// Human-readable agent name, distinct from its [`AgentId`].
#[nutype(
    validate(len_char_min = 1, len_char_max = 200),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct AgentName(String);

/// Free-form kind tag (e.g. `"financial"`, `"mycology"`); concrete domain
/// agents are external collaborators, so the core treats this as opaque.
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct AgentKind(String);

/// A single named functional affordance an agent advertises.
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct CapabilityName(String);

/// Bound on an agent's simultaneous in-flight tasks.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Default, TryFrom, Into),
    default = 4
)]
pub struct MaxInFlight(u32);

/// Bound on an agent's mailbox depth.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Default, TryFrom, Into),
    default = 1_000
)]
pub struct QueueDepth(usize);

/// Base timeout applied to tasks routed to this agent absent an explicit deadline.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3_600_000),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Default, TryFrom, Into),
    default = 30_000
)]
pub struct BaseTimeoutMs(u64);

/// Declared resource ceilings an agent advertises at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredLimits {
    pub max_in_flight: MaxInFlight,
    pub queue_depth: QueueDepth,
    pub base_timeout_ms: BaseTimeoutMs,
}

impl Default for DeclaredLimits {
    fn default() -> Self {
        Self {
            max_in_flight: MaxInFlight::default(),
            queue_depth: QueueDepth::default(),
            base_timeout_ms: BaseTimeoutMs::default(),
        }
    }
}

/// Identity and capability catalog entry for a single agent.
///
/// Immutable after registration; re-registering the same `agent_id` replaces
/// the descriptor atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: AgentId,
    pub name: AgentName,
    pub kind: AgentKind,
    pub version: u64,
    pub capabilities: HashSet<CapabilityName>,
    pub config: serde_json::Value,
    pub declared_limits: DeclaredLimits,
}

impl AgentDescriptor {
    /// Returns true if this descriptor advertises `capability`.
    #[must_use]
    pub fn has_capability(&self, capability: &CapabilityName) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Initializing,
    Ready,
    Busy,
    Degraded,
    Quarantined,
    Stopped,
}

impl AgentStatus {
    /// Whether the scheduler may route normal-priority tasks to an agent in this state.
    #[must_use]
    pub fn eligible_for_normal_routing(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }

    /// Whether the scheduler may route low-priority tasks to an agent in this state.
    #[must_use]
    pub fn eligible_for_low_priority_routing(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy | Self::Degraded)
    }

    /// Validates the monotonic transitions of the agent status state diagram.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use AgentStatus::{Busy, Degraded, Initializing, Quarantined, Ready, Stopped};
        match (*self, next) {
            (Initializing, Ready) => true,
            (Ready, Busy) | (Busy, Ready) => true,
            (Ready | Busy, Degraded) => true,
            (Degraded, Ready) => true,
            (_, Quarantined) => !matches!(self, Stopped),
            (Quarantined, Stopped) => true,
            (s, n) if s == n => true,
            _ => false,
        }
    }
}

/// A liveness/degradation report an agent's `health()` call returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthReport {
    Ok,
    Degraded { reason: String },
    Failed { reason: String },
}

/// A heartbeat sample recorded by the registry from the supervisor's probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub at: SystemTime,
    pub mailbox_latency_ms: u64,
    pub self_reported_degraded: bool,
}

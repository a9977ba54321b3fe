//! Multi-Agent Orchestration Core: registry, message bus, task scheduler,
//! supervisor, LLM gateway, action gate & audit, memory subsystem, and
//! control-plane HTTP API for the Mycosoft agent fleet.

pub mod action_gate;
pub mod agent_contract;
pub mod bus;
pub mod config;
pub mod control_plane;
pub mod domain;
pub mod error;
pub mod llm_gateway;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod stores;
pub mod supervisor;
pub mod time_provider;

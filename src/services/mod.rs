// src/services/mod.rs

//! RPC handler modules and the startup-time registration table.

pub mod healthcheck;
pub mod inter_agent;
pub mod job;
pub mod mysql;
pub mod proxy;

use crate::core::agent_state::AgentContext;
use crate::core::jobs::worker::JobEngine;
use crate::server::dispatch::ServiceRegistry;
use std::sync::Arc;

/// Builds the complete `(service, method) → handler` table. Every method the
/// agent serves is registered here, explicitly; nothing is discovered at
/// runtime.
pub fn build_registry(agent: &Arc<AgentContext>, engine: &Arc<JobEngine>) -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    healthcheck::register(&mut registry, agent);
    mysql::register(&mut registry, agent);
    proxy::register(&mut registry, agent);
    job::register(&mut registry, agent, engine);
    inter_agent::register(&mut registry, agent);
    registry
}

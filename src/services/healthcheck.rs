// src/services/healthcheck.rs

//! Liveness probe endpoint. No auth state, no side effects.

use crate::core::agent_state::AgentContext;
use crate::rpc::SERVICE_HEALTHCHECK;
use crate::server::dispatch::ServiceRegistry;
use serde_json::json;
use std::sync::Arc;

pub fn register(registry: &mut ServiceRegistry, _agent: &Arc<AgentContext>) {
    registry.register(SERVICE_HEALTHCHECK, "Ping", false, |_ctx, _payload| async {
        Ok(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
        }))
    });
}

// src/services/job.rs

//! Job bookkeeping RPCs.
//!
//! `Listen` is the streaming endpoint and lives in the connection loop; the
//! unary methods here cover retrieval, explicit scheduling, cancellation,
//! and acknowledgement.

use crate::core::agent_state::AgentContext;
use crate::core::errors::AgentError;
use crate::core::jobs::worker::JobEngine;
use crate::rpc::SERVICE_JOB;
use crate::server::dispatch::ServiceRegistry;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Deserialize)]
struct JobIdRequest {
    id: u64,
}

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, AgentError> {
    serde_json::from_value(payload)
        .map_err(|e| AgentError::InvalidArgument(format!("malformed request: {e}")))
}

pub fn register(
    registry: &mut ServiceRegistry,
    agent: &Arc<AgentContext>,
    engine: &Arc<JobEngine>,
) {
    let ctx = agent.clone();
    registry.register(SERVICE_JOB, "GetJob", false, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: JobIdRequest = parse(payload)?;
            let job = agent.jobs.require(request.id)?;
            Ok(serde_json::to_value(job)?)
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_JOB, "GetStatus", false, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: JobIdRequest = parse(payload)?;
            let status = agent
                .jobs
                .status(request.id)
                .ok_or(AgentError::JobNotFound(request.id))?;
            Ok(json!({ "status": status.to_string() }))
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_JOB, "Schedule", false, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: JobIdRequest = parse(payload)?;
            let job = agent.jobs.schedule(request.id)?;
            Ok(json!({ "status": job.status.to_string() }))
        }
    });

    let engine_handle = engine.clone();
    registry.register(SERVICE_JOB, "Cancel", false, move |_ctx, payload| {
        let engine = engine_handle.clone();
        async move {
            let request: JobIdRequest = parse(payload)?;
            let status = engine.cancel(request.id)?;
            Ok(json!({ "status": status.to_string() }))
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_JOB, "Acknowledge", false, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: JobIdRequest = parse(payload)?;
            agent.jobs.acknowledge(request.id)?;
            Ok(json!({}))
        }
    });
}

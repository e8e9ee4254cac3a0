// src/server/dispatch.rs

//! Method dispatch for the RPC server.
//!
//! Handlers are looked up in an explicit registration table built once at
//! startup; there is no reflection anywhere on the request path. The same
//! table also powers the async-job engine, which replays persisted requests
//! through it later.

use crate::core::agent_state::AgentContext;
use crate::core::errors::AgentError;
use crate::core::jobs::JobStatus;
use crate::rpc::{
    RequestEnvelope, RequestMeta, ResponseEnvelope, ResponseMeta, SERVICE_INTER_AGENT, Status,
    ensure_response_meta,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Who a request is acting as, decided by the auth interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScope {
    /// The control plane, holding the agent's own secret. May call anything.
    Direct,
    /// A peer agent of the named cluster. Confined to the inter-agent
    /// service, and to that cluster.
    Cluster(String),
}

/// Per-call context handed to handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub scope: AuthScope,
    pub peer: String,
}

impl RequestContext {
    /// Context used when the job worker replays a persisted request. Acts as
    /// the control plane; the original call already passed authentication.
    pub fn background() -> Self {
        Self {
            scope: AuthScope::Direct,
            peer: "background-job".to_string(),
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: RequestContext, payload: Value) -> Result<Value, AgentError>;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, AgentError>> + Send,
{
    async fn call(&self, ctx: RequestContext, payload: Value) -> Result<Value, AgentError> {
        (self.0)(ctx, payload).await
    }
}

pub struct MethodEntry {
    pub handler: Arc<dyn Handler>,
    /// True only when both the request and response messages of this method
    /// carry a `meta` field, i.e. the method may run as an async job.
    pub supports_meta: bool,
}

/// The `(service, method) → handler` table.
#[derive(Default)]
pub struct ServiceRegistry {
    methods: HashMap<(String, String), MethodEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register<F, Fut>(&mut self, service: &str, method: &str, supports_meta: bool, f: F)
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, AgentError>> + Send + 'static,
    {
        self.methods.insert(
            (service.to_string(), method.to_string()),
            MethodEntry {
                handler: Arc::new(FnHandler(f)),
                supports_meta,
            },
        );
    }

    pub fn get(&self, service: &str, method: &str) -> Option<&MethodEntry> {
        self.methods
            .get(&(service.to_string(), method.to_string()))
    }
}

/// Runs one authenticated request to completion and produces its response
/// frame. Streaming methods are handled by the connection loop before this
/// point.
pub async fn dispatch(
    agent: &Arc<AgentContext>,
    registry: &ServiceRegistry,
    scope: AuthScope,
    peer: &str,
    request: RequestEnvelope,
) -> ResponseEnvelope {
    let Some(entry) = registry.get(&request.service, &request.method) else {
        let err = AgentError::Unimplemented(format!(
            "{}/{} is not a registered method",
            request.service, request.method
        ));
        return ResponseEnvelope::error(request.id, &err);
    };

    // Deferred execution: persist a draft and answer with its handle. The
    // inter-agent service never defers, by construction.
    if entry.supports_meta && request.service != SERVICE_INTER_AGENT {
        if let Some(meta) = RequestMeta::from_payload(&request.payload) {
            if meta.is_async {
                return match agent.jobs.create(
                    &request.service,
                    &request.method,
                    &format!("{}.{}Request", request.service, request.method),
                    request.payload,
                    meta.reference,
                    meta.scheduled_at,
                    meta.timeout_seconds,
                ) {
                    Ok(job) => {
                        let mut payload = Value::Null;
                        ensure_response_meta(&mut payload, &ResponseMeta::from_job(&job));
                        ResponseEnvelope::ok(request.id, payload)
                    }
                    Err(e) => ResponseEnvelope::error(request.id, &e),
                };
            }
        }
    }

    let ctx = RequestContext {
        scope,
        peer: peer.to_string(),
    };

    match entry.handler.call(ctx, request.payload).await {
        Ok(mut payload) => {
            if entry.supports_meta {
                let meta = ResponseMeta {
                    status: Some(JobStatus::Success.to_string()),
                    ..Default::default()
                };
                ensure_response_meta(&mut payload, &meta);
            }
            ResponseEnvelope::ok(request.id, payload)
        }
        Err(err) => {
            // Aborts (validation, not-found, auth) surface as RPC status;
            // operational failures on meta-capable methods come back as a
            // FAILURE meta so async and sync callers see the same shape.
            let status = Status::from_error(&err);
            let is_abort = matches!(
                status,
                Status::InvalidArgument
                    | Status::NotFound
                    | Status::AlreadyExists
                    | Status::PermissionDenied
                    | Status::Unauthenticated
                    | Status::Unimplemented
            );
            if entry.supports_meta && !is_abort {
                let meta = ResponseMeta {
                    status: Some(JobStatus::Failure.to_string()),
                    error_message: Some(err.to_string()),
                    trace: Some(format!("{err:?}")),
                    ..Default::default()
                };
                let mut payload = Value::Null;
                ensure_response_meta(&mut payload, &meta);
                ResponseEnvelope::ok(request.id, payload)
            } else {
                ResponseEnvelope::error(request.id, &err)
            }
        }
    }
}

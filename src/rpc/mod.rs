// src/rpc/mod.rs

//! Wire protocol for agent RPC.
//!
//! Unary request/response envelopes, JSON-encoded inside length-delimited
//! frames. The status vocabulary mirrors the usual RPC status codes so the
//! control plane can treat agents uniformly. `JobService/Listen` is the one
//! streaming method: the server keeps emitting response frames on the same
//! connection until the peer goes away.

pub mod client;

use crate::core::errors::AgentError;
use crate::core::jobs::JobRecord;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SERVICE_HEALTHCHECK: &str = "HealthCheckService";
pub const SERVICE_MYSQL: &str = "MySQLService";
pub const SERVICE_PROXY: &str = "ProxyService";
pub const SERVICE_JOB: &str = "JobService";
pub const SERVICE_INTER_AGENT: &str = "InterAgentService";

/// Maximum accepted frame size. Large enough for any config payload, small
/// enough to bound a misbehaving peer.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    Unavailable,
    Unimplemented,
    Internal,
    DeadlineExceeded,
}

impl Status {
    pub fn from_error(err: &AgentError) -> Self {
        match err {
            AgentError::InvalidArgument(_) => Status::InvalidArgument,
            AgentError::ServiceNotFound(_)
            | AgentError::JobNotFound(_)
            | AgentError::ClusterConfigNotFound(_)
            | AgentError::NodeNotFound { .. } => Status::NotFound,
            AgentError::ServiceExists(_) => Status::AlreadyExists,
            AgentError::PermissionDenied(_) => Status::PermissionDenied,
            AgentError::Unauthenticated(_) => Status::Unauthenticated,
            AgentError::Unimplemented(_) => Status::Unimplemented,
            AgentError::Timeout(_) => Status::DeadlineExceeded,
            AgentError::NoWorkingCredentials(_) | AgentError::Kv(_) => Status::Unavailable,
            _ => Status::Internal,
        }
    }
}

/// One request frame.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestEnvelope {
    pub id: u64,
    pub service: String,
    pub method: String,
    pub auth_token: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One response frame. Streaming methods emit several frames sharing the
/// request id.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub code: Status,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ResponseEnvelope {
    pub fn ok(id: u64, payload: serde_json::Value) -> Self {
        Self {
            id,
            code: Status::Ok,
            message: String::new(),
            payload,
        }
    }

    pub fn error(id: u64, err: &AgentError) -> Self {
        Self {
            id,
            code: Status::from_error(err),
            message: err.to_string(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, AgentError> {
        Ok(serde_json::to_vec(self)?.into())
    }
}

/// Deferred-execution directives a request may carry under its `meta` field.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RequestMeta {
    #[serde(default)]
    pub is_async: bool,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl RequestMeta {
    /// Pulls the `meta` object out of a request payload, tolerating both its
    /// absence and unknown fields.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        payload
            .get("meta")
            .and_then(|meta| serde_json::from_value(meta.clone()).ok())
    }
}

/// Job bookkeeping reflected back to callers under the response `meta` field.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ResponseMeta {
    #[serde(default)]
    pub job_id: Option<u64>,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub trace: Option<String>,
}

impl ResponseMeta {
    pub fn from_job(job: &JobRecord) -> Self {
        Self {
            job_id: Some(job.id),
            reference: job.reference.clone(),
            status: Some(job.status.to_string()),
            created_at: Some(job.created_at),
            scheduled_at: job.scheduled_at,
            started_at: job.started_at,
            ended_at: job.ended_at,
            error_message: job.error_message.clone(),
            trace: job.trace.clone(),
        }
    }
}

/// Injects a `meta` object into a response payload, upgrading `Null` to an
/// object first. Existing meta objects with an explicit status are left
/// untouched.
pub fn ensure_response_meta(payload: &mut serde_json::Value, meta: &ResponseMeta) {
    if payload.is_null() {
        *payload = serde_json::json!({});
    }
    if let Some(object) = payload.as_object_mut() {
        let has_status = object
            .get("meta")
            .and_then(|m| m.get("status"))
            .is_some_and(|s| !s.is_null());
        if !has_status {
            if let Ok(meta_value) = serde_json::to_value(meta) {
                object.insert("meta".to_string(), meta_value);
            }
        }
    }
}

/// Reads the handler-reported status out of a response payload, if any.
pub fn response_meta_status(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("meta")
        .and_then(|m| m.get("status"))
        .and_then(|s| s.as_str())
        .map(|s| s.to_string())
}

// src/server/auth.rs

//! Authentication interceptor for the RPC server.
//!
//! Every request carries one opaque credential of the form
//! `"<src_type>:<token>:<cluster_id>"`. `direct` is the control plane holding
//! the agent's own secret; `cluster` is a peer agent presenting the shared
//! token of one cluster. The interceptor runs before any handler and decides
//! the request's [`AuthScope`]; a rejected request never reaches a handler.

use crate::core::agent_state::AgentContext;
use crate::core::errors::AgentError;
use crate::core::util::sha256_hex;
use crate::rpc::{RequestEnvelope, SERVICE_INTER_AGENT};
use crate::server::dispatch::AuthScope;

/// Validates the request's credential and, for cluster-scoped callers,
/// pins the payload's `cluster_id` to the token's cluster so handlers can
/// never be fed a forged one.
pub fn authenticate(
    agent: &AgentContext,
    request: &mut RequestEnvelope,
) -> Result<AuthScope, AgentError> {
    let mut parts = request.auth_token.splitn(3, ':');
    let (Some(src_type), Some(token), Some(cluster_id)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(AgentError::Unauthenticated(
            "invalid auth token format".to_string(),
        ));
    };

    if token.is_empty() {
        return Err(AgentError::Unauthenticated(
            "invalid auth token format".to_string(),
        ));
    }

    match src_type {
        "direct" => {
            if sha256_hex(token) != agent.config.auth_token_hash {
                return Err(AgentError::Unauthenticated("invalid auth token".to_string()));
            }
            if request.service == SERVICE_INTER_AGENT {
                let has_cluster_id = request
                    .payload
                    .get("cluster_id")
                    .and_then(|v| v.as_str())
                    .is_some_and(|s| !s.is_empty());
                if !has_cluster_id {
                    return Err(AgentError::Unauthenticated(
                        "inter-agent calls from the control plane must include a cluster_id"
                            .to_string(),
                    ));
                }
            }
            Ok(AuthScope::Direct)
        }
        "cluster" => {
            if cluster_id.is_empty() {
                return Err(AgentError::Unauthenticated(
                    "cluster auth token must include a cluster_id".to_string(),
                ));
            }
            if request.service != SERVICE_INTER_AGENT {
                return Err(AgentError::Unauthenticated(format!(
                    "cluster auth token can only be used for {SERVICE_INTER_AGENT}"
                )));
            }
            let Some(expected) = agent.shared_tokens.get(cluster_id) else {
                return Err(AgentError::Unauthenticated(
                    "unknown cluster_id in auth token".to_string(),
                ));
            };
            if token != expected {
                return Err(AgentError::Unauthenticated(
                    "invalid auth token for the given cluster_id".to_string(),
                ));
            }

            // Pin the body-level cluster id to the authenticated one.
            if let Some(object) = request.payload.as_object_mut() {
                object.insert(
                    "cluster_id".to_string(),
                    serde_json::Value::String(cluster_id.to_string()),
                );
            } else if request.payload.is_null() {
                request.payload = serde_json::json!({ "cluster_id": cluster_id });
            }
            Ok(AuthScope::Cluster(cluster_id.to_string()))
        }
        _ => Err(AgentError::Unauthenticated(
            "invalid auth token format".to_string(),
        )),
    }
}

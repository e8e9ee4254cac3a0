// src/services/inter_agent.rs

//! The one service peer agents may call with cluster credentials.
//!
//! Handlers here must never trust the body-level `cluster_id` alone: for
//! cluster-scoped callers the auth interceptor has already pinned it to the
//! authenticated cluster, and every node-touching method re-checks that the
//! target actually belongs to that cluster.

use crate::core::agent_state::AgentContext;
use crate::core::errors::AgentError;
use crate::core::kv::{load_cluster_view, working_credentials};
use crate::core::util::{find_available_port, random_string};
use crate::domain::mysql::MysqlNode;
use crate::domain::runtime::RsyncSidecarSpec;
use crate::domain::sql_ping;
use crate::rpc::SERVICE_INTER_AGENT;
use crate::server::dispatch::ServiceRegistry;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

#[derive(Deserialize)]
struct NodeScopedRequest {
    cluster_id: String,
    node_id: String,
}

#[derive(Deserialize)]
struct RevokeRsyncRequest {
    cluster_id: String,
    instance_id: String,
}

fn parse<T: serde::de::DeserializeOwned>(payload: serde_json::Value) -> Result<T, AgentError> {
    serde_json::from_value(payload)
        .map_err(|e| AgentError::InvalidArgument(format!("malformed request: {e}")))
}

/// Loads a local database node, enforcing that it belongs to the cluster the
/// caller is authenticated for.
fn load_cluster_member(
    agent: &Arc<AgentContext>,
    cluster_id: &str,
    node_id: &str,
) -> Result<MysqlNode, AgentError> {
    let node = MysqlNode::load(agent.clone(), node_id)?;
    if node.record.cluster_id != cluster_id {
        return Err(AgentError::PermissionDenied(
            "node does not belong to the specified cluster".to_string(),
        ));
    }
    Ok(node)
}

pub fn register(registry: &mut ServiceRegistry, agent: &Arc<AgentContext>) {
    let ctx = agent.clone();
    registry.register(
        SERVICE_INTER_AGENT,
        "CheckDatabaseReachability",
        false,
        move |_ctx, payload| {
            let agent = ctx.clone();
            async move {
                let request: NodeScopedRequest = parse(payload)?;
                let kv = working_credentials(
                    &agent.config.etcd,
                    &agent.catalog,
                    &request.cluster_id,
                )
                .await?;
                let view = load_cluster_view(&kv, &request.cluster_id).await?;
                let node = view.node(&request.node_id)?;

                let reachable = sql_ping(
                    &node.ip,
                    node.db_port,
                    &view.topology.replication_user,
                    &view.topology.replication_password,
                    agent.config.monitor.reachability_timeout,
                )
                .await
                .unwrap_or(false);

                Ok(json!({ "reachable": reachable }))
            }
        },
    );

    let ctx = agent.clone();
    registry.register(
        SERVICE_INTER_AGENT,
        "RequestRsyncAccess",
        false,
        move |_ctx, payload| {
            let agent = ctx.clone();
            async move {
                let request: NodeScopedRequest = parse(payload)?;
                let node = load_cluster_member(&agent, &request.cluster_id, &request.node_id)?;

                // The naming convention is load-bearing: revocation
                // authorizes against this prefix.
                let instance_id = format!(
                    "rsync.{}.{}.{}",
                    request.cluster_id,
                    request.node_id,
                    random_string(16)
                );
                let port = find_available_port(20000, 25000, &HashSet::new())?;
                let username = random_string(32);
                let password = random_string(32);

                let spec = RsyncSidecarSpec {
                    instance_id: instance_id.clone(),
                    image: agent.config.rsync.image.clone(),
                    data_path: node.data_path().to_string(),
                    port,
                    username: username.clone(),
                    password: password.clone(),
                    uid: agent.config.rsync.uid,
                    gid: agent.config.rsync.gid,
                };
                agent.sidecar_runtime.launch_rsync(&spec).await?;
                info!(%instance_id, "Launched rsync sidecar");

                Ok(json!({
                    "instance_id": instance_id,
                    "port": port,
                    "username": username,
                    "password": password,
                    "src_path": "/data",
                }))
            }
        },
    );

    let ctx = agent.clone();
    registry.register(
        SERVICE_INTER_AGENT,
        "RevokeRsyncAccess",
        false,
        move |_ctx, payload| {
            let agent = ctx.clone();
            async move {
                let request: RevokeRsyncRequest = parse(payload)?;
                if !request
                    .instance_id
                    .starts_with(&format!("rsync.{}.", request.cluster_id))
                {
                    return Err(AgentError::PermissionDenied(
                        "instance id does not match the cluster".to_string(),
                    ));
                }
                agent.sidecar_runtime.remove(&request.instance_id).await?;
                info!(instance_id = %request.instance_id, "Removed rsync sidecar");
                Ok(json!({}))
            }
        },
    );

    let ctx = agent.clone();
    registry.register(
        SERVICE_INTER_AGENT,
        "SyncReplicationUser",
        false,
        move |_ctx, payload| {
            let agent = ctx.clone();
            async move {
                let request: NodeScopedRequest = parse(payload)?;
                let node = load_cluster_member(&agent, &request.cluster_id, &request.node_id)?;
                node.sync_replication_user().await?;
                Ok(json!({}))
            }
        },
    );
}

// src/domain/mod.rs

//! Domain wrappers around the units the agent manages.
//!
//! These are the collaborators the coordination plane drives: a MySQL node
//! exposing its health probe and replication plumbing, a ProxySQL instance
//! exposing its admin interface, and the runtime seams for unit/container
//! supervision.

pub mod mysql;
pub mod proxy;
pub mod runtime;

use crate::core::agent_state::AgentContext;
use crate::core::cluster::ClusterView;
use crate::core::errors::AgentError;
use crate::rpc::client::{AgentClient, Credential};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder};
use std::time::Duration;

/// Opens a SQL connection with a bounded handshake.
pub async fn sql_connect(
    host: &str,
    port: u16,
    user: &str,
    password: &str,
    timeout: Duration,
) -> Result<Conn, AgentError> {
    let opts: Opts = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(port)
        .user(Some(user))
        .pass(Some(password))
        .into();
    let conn = tokio::time::timeout(timeout, Conn::new(opts))
        .await
        .map_err(|_| AgentError::Timeout(format!("SQL connect to {host}:{port}")))??;
    Ok(conn)
}

/// True when the database at `host:port` accepts the credentials and answers
/// a trivial query within `timeout`.
pub async fn sql_ping(
    host: &str,
    port: u16,
    user: &str,
    password: &str,
    timeout: Duration,
) -> Result<bool, AgentError> {
    let mut conn = sql_connect(host, port, user, password, timeout).await?;
    let result = tokio::time::timeout(timeout, conn.query_drop("SELECT 1")).await;
    Ok(matches!(result, Ok(Ok(()))))
}

/// Connects to another agent of the same cluster using the cluster's shared
/// token. Connections are short-lived by design; callers drop them after a
/// call or two.
pub async fn cluster_agent_client(
    agent: &AgentContext,
    view: &ClusterView,
    host: &str,
    port: u16,
) -> Result<AgentClient, AgentError> {
    AgentClient::connect(
        host,
        port,
        agent.config.tls.ca_path.as_deref(),
        Credential::Cluster {
            token: view.topology.shared_token.clone(),
            cluster_id: view.cluster_id.clone(),
        },
        Duration::from_secs(5),
    )
    .await
}

/// Connects to the agent hosting the cluster's proxy.
pub async fn proxy_agent_client(
    agent: &AgentContext,
    view: &ClusterView,
) -> Result<AgentClient, AgentError> {
    let proxy = view.proxy();
    cluster_agent_client(agent, view, &proxy.ip, proxy.agent_port).await
}

/// Connects to the agent hosting one database node of the cluster.
pub async fn node_agent_client(
    agent: &AgentContext,
    view: &ClusterView,
    node_id: &str,
) -> Result<AgentClient, AgentError> {
    let node = view.node(node_id)?;
    cluster_agent_client(agent, view, &node.ip, node.agent_port).await
}

// src/domain/proxy.rs

//! The ProxySQL collaborator.
//!
//! Wraps one locally hosted proxy and executes the reconciliation batches
//! computed by [`crate::core::reconcile`] against its admin interface. The
//! admin port speaks the MySQL protocol, so the same SQL client is used.

use crate::core::agent_state::AgentContext;
use crate::core::catalog::{ServiceKind, ServiceRecord};
use crate::core::cluster::{ClusterView, NodeRole, NodeStatus};
use crate::core::errors::AgentError;
use crate::core::kv::{load_cluster_view, working_credentials};
use crate::core::reconcile::{
    BackendRow, SYSTEM_USER_BLOCKLIST, backend_server_statements, desired_backend_rows,
    diff_users, escape_sql, servers_in_sync, user_statements,
};
use crate::domain::sql_connect;
use mysql_async::Conn;
use mysql_async::prelude::Queryable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Kind-specific metadata stored on a proxy service record.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProxyMetadata {
    pub admin_port: u16,
    pub admin_password: String,
    pub monitor_password: String,
    pub db_readwrite_port: u16,
    pub db_readonly_port: u16,
    pub base_path: String,
    pub data_path: String,
    pub config_path: String,
}

/// Outcome of one user reconciliation, reported back over RPC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSyncOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

pub struct ProxyNode {
    pub record: ServiceRecord,
    pub meta: ProxyMetadata,
    agent: Arc<AgentContext>,
}

impl ProxyNode {
    pub fn load(agent: Arc<AgentContext>, id: &str) -> Result<Self, AgentError> {
        let record = agent.catalog.require(id)?;
        if record.service_kind != ServiceKind::Proxysql {
            return Err(AgentError::InvalidArgument(format!(
                "service '{id}' is not a proxy"
            )));
        }
        let meta: ProxyMetadata = serde_json::from_value(record.metadata.clone())?;
        Ok(Self {
            record,
            meta,
            agent,
        })
    }

    pub fn monitor_credential(&self) -> (String, String) {
        ("monitor".to_string(), self.meta.monitor_password.clone())
    }

    /// Opens an admin session on the local proxy.
    pub async fn admin_connection(&self) -> Result<Conn, AgentError> {
        sql_connect(
            "127.0.0.1",
            self.meta.admin_port,
            "admin",
            &self.meta.admin_password,
            Duration::from_secs(5),
        )
        .await
    }

    async fn current_backend_rows(&self, conn: &mut Conn) -> Result<Vec<BackendRow>, AgentError> {
        let rows: Vec<(String, String, String, String)> = conn
            .query("SELECT hostgroup_id, hostname, port, weight FROM mysql_servers")
            .await?;
        let mut parsed = Vec::with_capacity(rows.len());
        for (hostgroup, host, port, weight) in rows {
            parsed.push(BackendRow {
                hostgroup: hostgroup.parse().unwrap_or(0),
                host,
                port: port.parse().unwrap_or(0),
                weight: weight.parse().unwrap_or(0),
            });
        }
        Ok(parsed)
    }

    async fn cluster_view(&self) -> Result<ClusterView, AgentError> {
        let kv = working_credentials(
            &self.agent.config.etcd,
            &self.agent.catalog,
            &self.record.cluster_id,
        )
        .await?;
        load_cluster_view(&kv, &self.record.cluster_id).await
    }

    /// Brings `mysql_servers` in line with the cluster topology. Returns
    /// whether anything had to change; matching state is a strict no-op,
    /// without even a LOAD.
    pub async fn sync_servers(&self, view: Option<&ClusterView>) -> Result<bool, AgentError> {
        let owned;
        let view = match view {
            Some(v) => v,
            None => {
                owned = self.cluster_view().await?;
                &owned
            }
        };

        let desired = desired_backend_rows(&view.topology);
        let mut conn = self.admin_connection().await?;
        let current = self.current_backend_rows(&mut conn).await?;

        if servers_in_sync(&current, &desired) {
            return Ok(false);
        }

        // The delete-then-insert batch is safe: nothing reaches the runtime
        // until LOAD MYSQL SERVERS TO RUNTIME.
        for statement in backend_server_statements(&desired) {
            conn.query_drop(statement.as_str()).await.map_err(|e| {
                AgentError::Sql(format!("backend server sync statement failed: {e}"))
            })?;
        }
        info!(
            proxy = %self.record.id,
            cluster = %view.cluster_id,
            "Backend servers reconciled"
        );
        Ok(true)
    }

    /// Mirrors the master's user catalog into `mysql_users`.
    pub async fn sync_users(&self) -> Result<UserSyncOutcome, AgentError> {
        let view = self.cluster_view().await?;

        let mut exclude: Vec<String> = SYSTEM_USER_BLOCKLIST
            .iter()
            .map(|s| s.to_string())
            .collect();
        exclude.push(view.topology.replication_user.clone());

        let mut master_conn = self.connect_any_master(&view).await?;
        let exclude_list = exclude
            .iter()
            .map(|user| format!("'{}'", escape_sql(user)))
            .collect::<Vec<_>>()
            .join(", ");
        let db_users: Vec<(String, String)> = master_conn
            .query(format!(
                "SELECT User, authentication_string FROM mysql.user \
                 WHERE authentication_string IS NOT NULL \
                   AND authentication_string != '' \
                   AND Host NOT IN ('localhost', '127.0.0.1', '::1') \
                   AND User NOT IN ({exclude_list})"
            ))
            .await?;
        drop(master_conn);

        let mut conn = self.admin_connection().await?;
        let proxy_rows: Vec<(String, String)> = conn
            .query("SELECT username, password FROM mysql_users")
            .await?;
        let proxy_users: HashMap<String, String> = proxy_rows.into_iter().collect();

        let diff = diff_users(&db_users, &proxy_users);
        if diff.is_empty() {
            return Ok(UserSyncOutcome::default());
        }

        // No transactions on the admin interface: any failure surfaces
        // as-is rather than retrying half a batch.
        for statement in user_statements(&diff) {
            conn.query_drop(statement.as_str())
                .await
                .map_err(|e| AgentError::Sql(format!("user sync statement failed: {e}")))?;
        }

        let outcome = UserSyncOutcome {
            added: diff.to_add.iter().map(|(u, _)| u.clone()).collect(),
            removed: diff.to_remove.clone(),
            updated: diff.to_update.iter().map(|(u, _)| u.clone()).collect(),
        };
        info!(
            proxy = %self.record.id,
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            updated = outcome.updated.len(),
            "Proxy users reconciled"
        );
        Ok(outcome)
    }

    /// Connects to any reachable master with the replication credentials.
    async fn connect_any_master(&self, view: &ClusterView) -> Result<Conn, AgentError> {
        for (node_id, node) in &view.topology.nodes {
            if node.role != NodeRole::Master || node.status != NodeStatus::Online {
                continue;
            }
            match sql_connect(
                &node.ip,
                node.db_port,
                &view.topology.replication_user,
                &view.topology.replication_password,
                Duration::from_secs(5),
            )
            .await
            {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(%node_id, "Master unreachable for user sync: {e}");
                }
            }
        }
        Err(AgentError::InvalidState(
            "no reachable master node to read users from".to_string(),
        ))
    }
}

/// Runs backend-server reconciliation on every local proxy of a cluster.
/// Failures are logged per proxy; one broken proxy does not stop the rest.
pub async fn sync_backend_servers_for_cluster(
    agent: &Arc<AgentContext>,
    cluster_id: &str,
    view: Option<&ClusterView>,
) {
    for proxy_id in agent.catalog.proxy_ids(Some(cluster_id)) {
        match ProxyNode::load(agent.clone(), &proxy_id) {
            Ok(proxy) => {
                if let Err(e) = proxy.sync_servers(view).await {
                    warn!(%proxy_id, "Backend server sync failed: {e}");
                }
            }
            Err(e) => warn!(%proxy_id, "Failed to load proxy: {e}"),
        }
    }
}

/// Runs backend-server reconciliation on every local proxy of every cluster.
pub async fn sync_backend_servers_for_all(agent: &Arc<AgentContext>) {
    for proxy_id in agent.catalog.proxy_ids(None) {
        match ProxyNode::load(agent.clone(), &proxy_id) {
            Ok(proxy) => {
                if let Err(e) = proxy.sync_servers(None).await {
                    warn!(%proxy_id, "Backend server sync failed: {e}");
                }
            }
            Err(e) => warn!(%proxy_id, "Failed to load proxy: {e}"),
        }
    }
}

/// Runs user reconciliation on every local proxy.
pub async fn sync_users_for_all(agent: &Arc<AgentContext>) {
    for proxy_id in agent.catalog.proxy_ids(None) {
        match ProxyNode::load(agent.clone(), &proxy_id) {
            Ok(proxy) => {
                if let Err(e) = proxy.sync_users().await {
                    warn!(%proxy_id, "User sync failed: {e}");
                }
            }
            Err(e) => warn!(%proxy_id, "Failed to load proxy: {e}"),
        }
    }
}

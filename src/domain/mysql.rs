// src/domain/mysql.rs

//! The MySQL/MariaDB node collaborator.
//!
//! Wraps one catalog record of a locally hosted database and gives the
//! coordination plane what it needs: a health probe, SQL connections, the
//! data path, and the replication workflows (replica bootstrap over an rsync
//! sidecar, replication-user upkeep).

use crate::core::agent_state::AgentContext;
use crate::core::catalog::ServiceRecord;
use crate::core::cluster::{ClusterView, DbKind, NodeHealth};
use crate::core::errors::AgentError;
use crate::core::keys;
use crate::core::kv::{KvClient, load_cluster_view, working_credentials};
use crate::core::reconcile::escape_sql;
use crate::core::util::now_ms;
use crate::domain::{node_agent_client, sql_connect};
use crate::rpc::client::RsyncAccess;
use mysql_async::Conn;
use mysql_async::prelude::Queryable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{info, warn};

/// Kind-specific metadata stored on a database service record.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MysqlMetadata {
    pub root_password: String,
    pub server_id: u32,
    pub db_port: u16,
    pub base_path: String,
    pub data_path: String,
    pub config_path: String,
    pub init_path: String,
}

pub struct MysqlNode {
    pub record: ServiceRecord,
    pub meta: MysqlMetadata,
    agent: Arc<AgentContext>,
}

impl MysqlNode {
    /// Loads a database node from the catalog. Proxy records are rejected.
    pub fn load(agent: Arc<AgentContext>, id: &str) -> Result<Self, AgentError> {
        let record = agent.catalog.require(id)?;
        if !record.service_kind.is_database() {
            return Err(AgentError::InvalidArgument(format!(
                "service '{id}' is not a database"
            )));
        }
        let meta: MysqlMetadata = serde_json::from_value(record.metadata.clone())?;
        Ok(Self {
            record,
            meta,
            agent,
        })
    }

    pub fn data_path(&self) -> &str {
        &self.meta.data_path
    }

    pub fn db_kind(&self) -> DbKind {
        match self.record.service_kind {
            crate::core::catalog::ServiceKind::Mysql => DbKind::Mysql,
            _ => DbKind::Mariadb,
        }
    }

    /// Opens a root connection to the local instance.
    pub async fn db_connection(&self) -> Result<Conn, AgentError> {
        sql_connect(
            "127.0.0.1",
            self.meta.db_port,
            "root",
            &self.meta.root_password,
            self.agent.config.healthcheck.probe_timeout,
        )
        .await
    }

    /// Runs one health probe on an already-open connection. The GTID is the
    /// payload; a probe that cannot read it fails.
    pub async fn health_probe(&self, conn: &mut Conn) -> Result<NodeHealth, AgentError> {
        let timeout = self.agent.config.healthcheck.probe_timeout;
        let gtid: Option<String> = tokio::time::timeout(
            timeout,
            conn.query_first("SELECT @@gtid_current_pos"),
        )
        .await
        .map_err(|_| AgentError::Timeout("health probe".to_string()))??;
        Ok(NodeHealth {
            db_kind: self.db_kind(),
            reported_at_ms: now_ms(),
            gtid: gtid.unwrap_or_default(),
        })
    }

    /// KV client authenticated with this record's own etcd credential.
    pub async fn kv(&self) -> Result<KvClient, AgentError> {
        KvClient::connect(&self.agent.config.etcd, &self.record.etcd_credential()).await
    }

    pub async fn cluster_view(&self, kv: &KvClient) -> Result<ClusterView, AgentError> {
        load_cluster_view(kv, &self.record.cluster_id).await
    }

    /// Publishes one health heartbeat under the node's status key.
    pub async fn publish_health(
        &self,
        kv: &KvClient,
        health: &NodeHealth,
    ) -> Result<(), AgentError> {
        let key = keys::node_status(&self.record.cluster_id, &self.record.id);
        kv.put(&key, serde_json::to_vec(health)?).await
    }

    /// Waits until the local instance answers queries, polling once a second.
    pub async fn wait_for_db(&self, timeout: Duration) -> Result<Conn, AgentError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.db_connection().await {
                Ok(mut conn) => {
                    if conn.query_drop("SELECT 1").await.is_ok() {
                        return Ok(conn);
                    }
                }
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(AgentError::Timeout(format!(
                    "database '{}' did not come up",
                    self.record.id
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Bootstraps this instance as a replica of the cluster's online master.
    ///
    /// Two rsync passes: a dirty one against the live master, then a short
    /// one under `FLUSH TABLES WITH READ LOCK` that also captures the GTID
    /// the replica will resume from. The sidecar access is revoked on every
    /// exit path.
    pub async fn setup_replica(&self) -> Result<(), AgentError> {
        let kv = working_credentials(
            &self.agent.config.etcd,
            &self.agent.catalog,
            &self.record.cluster_id,
        )
        .await?;
        let view = self.cluster_view(&kv).await?;

        let master_id = view
            .online_master_ids()
            .into_iter()
            .next()
            .ok_or_else(|| {
                AgentError::InvalidState("no online master node to replicate from".to_string())
            })?;
        let master = view.node(&master_id)?.clone();

        self.agent.service_runtime.stop(&self.record.id).await?;

        let rpc_timeout = self.agent.config.rsync.rpc_timeout;
        let mut source_agent = node_agent_client(&self.agent, &view, &master_id).await?;
        let access = source_agent
            .request_rsync_access(&self.record.cluster_id, &master_id, rpc_timeout)
            .await?;

        let result = self
            .replicate_from(&view, &master_id, &master.ip, master.db_port, &access)
            .await;

        if let Err(e) = source_agent
            .revoke_rsync_access(&self.record.cluster_id, &access.instance_id, rpc_timeout)
            .await
        {
            warn!(
                instance_id = %access.instance_id,
                "Failed to revoke rsync access: {e}"
            );
        }

        result
    }

    async fn replicate_from(
        &self,
        view: &ClusterView,
        master_id: &str,
        master_ip: &str,
        master_db_port: u16,
        access: &RsyncAccess,
    ) -> Result<(), AgentError> {
        wait_for_sshd(master_ip, access.port, Duration::from_secs(30)).await?;

        // Phase 1: bulk copy without disturbing the running master.
        run_rsync(master_ip, access, &self.meta.data_path).await?;

        let rpc_timeout = self.agent.config.rsync.rpc_timeout;
        let mut source_agent = node_agent_client(&self.agent, view, master_id).await?;
        source_agent
            .sync_replication_user(&self.record.cluster_id, master_id, rpc_timeout)
            .await?;

        let mut master_conn = sql_connect(
            master_ip,
            master_db_port,
            &view.topology.replication_user,
            &view.topology.replication_password,
            Duration::from_secs(10),
        )
        .await?;

        // Phase 2: freeze writes, close the delta, record the position.
        master_conn.query_drop("FLUSH LOGS").await?;
        master_conn.query_drop("FLUSH TABLES WITH READ LOCK").await?;

        let phase2 = async {
            run_rsync(master_ip, access, &self.meta.data_path).await?;
            let gtid: Option<String> = master_conn
                .query_first("SELECT @@GLOBAL.gtid_current_pos")
                .await?;
            Ok::<_, AgentError>(gtid.unwrap_or_default())
        }
        .await;

        let unlock = master_conn.query_drop("UNLOCK TABLES").await;
        let captured_gtid = phase2?;
        unlock?;
        drop(master_conn);

        self.agent.service_runtime.start(&self.record).await?;
        self.wait_for_db(Duration::from_secs(180)).await?;

        let slave_pos = (!captured_gtid.is_empty()).then_some(captured_gtid.as_str());
        self.configure_replication(view, slave_pos).await?;
        info!(id = %self.record.id, master = master_id, "Replica bootstrap finished");
        Ok(())
    }

    /// Points this instance at the cluster's online master.
    ///
    /// Compatibility branch: with a GTID captured under the phase-2 read
    /// lock we seed `gtid_slave_pos` and use `current_pos`; without one the
    /// instance resumes from its own recorded `slave_pos`.
    pub async fn configure_replication(
        &self,
        view: &ClusterView,
        slave_pos: Option<&str>,
    ) -> Result<(), AgentError> {
        let master_id = view
            .online_master_ids()
            .into_iter()
            .next()
            .ok_or_else(|| {
                AgentError::InvalidState("no online master node to replicate from".to_string())
            })?;
        let master = view.node(&master_id)?;

        let mut conn = self.db_connection().await?;
        conn.query_drop("SET GLOBAL read_only = 1").await?;
        conn.query_drop("STOP SLAVE").await?;
        conn.query_drop("RESET SLAVE ALL").await?;

        if let Some(pos) = slave_pos {
            conn.query_drop(format!(
                "SET GLOBAL gtid_slave_pos = '{}'",
                escape_sql(pos)
            ))
            .await?;
        }

        let use_gtid = if slave_pos.is_some() {
            "current_pos"
        } else {
            "slave_pos"
        };
        conn.query_drop(format!(
            "CHANGE MASTER TO \
             MASTER_HOST = '{}', \
             MASTER_PORT = {}, \
             MASTER_USER = '{}', \
             MASTER_PASSWORD = '{}', \
             MASTER_USE_GTID = {use_gtid}",
            escape_sql(&master.ip),
            master.db_port,
            escape_sql(&view.topology.replication_user),
            escape_sql(&view.topology.replication_password),
        ))
        .await?;

        conn.query_drop("START SLAVE").await?;
        Ok(())
    }

    /// Creates or refreshes the replication user so it matches the cluster
    /// config, granting only what replication and user-sync need.
    pub async fn sync_replication_user(&self) -> Result<(), AgentError> {
        let kv = working_credentials(
            &self.agent.config.etcd,
            &self.agent.catalog,
            &self.record.cluster_id,
        )
        .await?;
        let view = self.cluster_view(&kv).await?;
        let user = view.topology.replication_user.clone();
        let password = view.topology.replication_password.clone();

        let mut conn = self.db_connection().await?;

        // Let the server compute the native hash so we can compare without
        // reimplementing its password scheme.
        let expected_hash: Option<String> = conn
            .exec_first("SELECT PASSWORD(?)", (password.clone(),))
            .await?;
        let current_hash: Option<String> = conn
            .exec_first(
                "SELECT authentication_string FROM mysql.user WHERE user = ? AND host = '%'",
                (user.clone(),),
            )
            .await?;

        match (&current_hash, &expected_hash) {
            (Some(current), Some(expected)) if current == expected => return Ok(()),
            (Some(_), _) => {
                conn.query_drop(format!(
                    "ALTER USER '{}'@'%' IDENTIFIED BY '{}'",
                    escape_sql(&user),
                    escape_sql(&password)
                ))
                .await?;
            }
            (None, _) => {
                conn.query_drop(format!(
                    "CREATE USER IF NOT EXISTS '{}'@'%' IDENTIFIED BY '{}'",
                    escape_sql(&user),
                    escape_sql(&password)
                ))
                .await?;
            }
        }

        conn.query_drop(format!(
            "GRANT REPLICATION SLAVE, REPLICATION CLIENT, RELOAD, READ_ONLY ADMIN \
             ON *.* TO '{}'@'%'",
            escape_sql(&user)
        ))
        .await?;
        conn.query_drop(format!(
            "GRANT SELECT ON mysql.user TO '{}'@'%'",
            escape_sql(&user)
        ))
        .await?;
        conn.query_drop("FLUSH PRIVILEGES").await?;
        Ok(())
    }
}

/// Polls until the sidecar's sshd accepts TCP connections.
async fn wait_for_sshd(host: &str, port: u16, timeout: Duration) -> Result<(), AgentError> {
    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect((host, port)).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(AgentError::Timeout(format!(
                "sshd at {host}:{port} did not come up"
            )));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// One rsync pass from the sidecar's exported directory into `dest`.
async fn run_rsync(host: &str, access: &RsyncAccess, dest: &str) -> Result<(), AgentError> {
    let ssh_command = format!(
        "ssh -p {} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
        access.port
    );
    let source = format!("{}@{}:{}/", access.username, host, access.src_path);

    let status = Command::new("sshpass")
        .args(["-p", &access.password])
        .args([
            "rsync",
            "-rlptvz",
            "--delete",
            "--rsync-path",
            "sudo rsync",
            "--exclude",
            "mysql.sock",
            "--exclude",
            "mysql.pid",
            "--exclude",
            "mysql-bin.*",
            "--exclude",
            "mysql-bin.index",
            "--exclude",
            "mariadb-bin.*",
            "--exclude",
            "mariadb-bin.index",
            "--exclude",
            "galera.*",
            "--exclude",
            "ib_logfile*",
            "--exclude",
            "ibtmp1",
            "--exclude",
            "mysqld-relay-bin.*",
            "--exclude",
            "relay-log.info",
            "--exclude",
            "mysql-error.log",
            "--inplace",
            "-e",
            &ssh_command,
            &source,
            dest,
        ])
        .status()
        .await?;

    if !status.success() {
        return Err(AgentError::Runtime(format!(
            "rsync from {host} exited with {status}"
        )));
    }
    Ok(())
}

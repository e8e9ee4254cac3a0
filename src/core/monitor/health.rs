// src/core/monitor/health.rs

//! Per-database health probe loops.
//!
//! One loop per locally hosted database, each owning a single reusable SQL
//! connection. A successful probe is published as the node's heartbeat; the
//! loop also heals the cluster config if this node is marked OFFLINE there
//! while clearly alive, rate-limited to one attempt per flip window.
//!
//! The set of probed databases follows the catalog: provisioning RPCs push
//! `add`/`remove` commands onto the broker, and a periodic reconciliation
//! sweeps up anything missed. Both paths are serialized on the monitor's
//! task map.

use crate::core::agent_state::AgentContext;
use crate::core::cluster::NodeStatus;
use crate::core::errors::AgentError;
use crate::core::keys;
use crate::core::kv::{KvClient, load_cluster_view};
use crate::core::pubsub::{MYSQL_MONITOR_COMMANDS, MonitorCommand};
use crate::domain::mysql::MysqlNode;
use mysql_async::Conn;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ProbeHandle {
    stop: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

pub struct HealthMonitor {
    agent: Arc<AgentContext>,
    probes: Mutex<HashMap<String, ProbeHandle>>,
}

impl HealthMonitor {
    pub fn new(agent: Arc<AgentContext>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            probes: Mutex::new(HashMap::new()),
        })
    }

    /// Command listener plus periodic catalog reconciliation, sharing one
    /// loop so membership changes are totally ordered.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut commands = self.agent.broker.subscribe(MYSQL_MONITOR_COMMANDS);
        let mut sync_tick =
            tokio::time::interval(self.agent.config.monitor.membership_sync_interval);
        info!("Health monitor started");

        loop {
            tokio::select! {
                message = commands.recv() => {
                    match message {
                        Ok(raw) => {
                            let Some(command) = MonitorCommand::parse(&raw) else { continue };
                            match command {
                                MonitorCommand::Add(id) => self.add_db(&id).await,
                                MonitorCommand::Remove(id) => self.remove_db(&id).await,
                                MonitorCommand::Reload(id) => {
                                    self.remove_db(&id).await;
                                    self.add_db(&id).await;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Health monitor lagged on commands, resyncing");
                            self.reconcile().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = sync_tick.tick() => {
                    self.reconcile().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Health monitor shutting down");
                    self.stop_all().await;
                    return;
                }
            }
        }
    }

    /// Publishes add/remove commands to close the gap between the catalog
    /// and the currently probed set.
    async fn reconcile(&self) {
        let desired = self.agent.catalog.database_ids();
        let current: Vec<String> = self.probes.lock().await.keys().cloned().collect();

        for id in &desired {
            if !current.contains(id) {
                self.agent
                    .broker
                    .publish_command(MYSQL_MONITOR_COMMANDS, "add", id);
            }
        }
        for id in &current {
            if !desired.contains(id) {
                self.agent
                    .broker
                    .publish_command(MYSQL_MONITOR_COMMANDS, "remove", id);
            }
        }
    }

    async fn add_db(&self, db_id: &str) {
        let mut probes = self.probes.lock().await;
        if probes.contains_key(db_id) {
            return;
        }
        if !self.agent.catalog.exists(db_id) {
            return;
        }
        let stop = CancellationToken::new();
        let handle = tokio::spawn(probe_loop(
            self.agent.clone(),
            db_id.to_string(),
            stop.clone(),
        ));
        probes.insert(db_id.to_string(), ProbeHandle { stop, handle });
        info!(db_id, "Started health probe loop");
    }

    async fn remove_db(&self, db_id: &str) {
        let Some(probe) = self.probes.lock().await.remove(db_id) else {
            return;
        };
        probe.stop.cancel();
        if tokio::time::timeout(Duration::from_secs(5), probe.handle)
            .await
            .is_err()
        {
            warn!(db_id, "Probe loop did not stop within its grace period");
        }
        info!(db_id, "Stopped health probe loop");
    }

    async fn stop_all(&self) {
        let ids: Vec<String> = self.probes.lock().await.keys().cloned().collect();
        for id in ids {
            self.remove_db(&id).await;
        }
    }

    /// Ids with a live probe loop, mainly for introspection and tests.
    pub async fn probed_ids(&self) -> Vec<String> {
        self.probes.lock().await.keys().cloned().collect()
    }
}

/// Whether the ONLINE-flip check is due. Never-checked (or reset after a
/// probe failure) means due immediately; otherwise one check per window.
pub fn flip_check_due(last_check: Option<Instant>, window: Duration) -> bool {
    last_check.is_none_or(|at| at.elapsed() >= window)
}

/// The probe loop for one database. Owns one SQL connection and one KV
/// client, both re-established lazily after failures.
async fn probe_loop(agent: Arc<AgentContext>, db_id: String, stop: CancellationToken) {
    let node = match MysqlNode::load(agent.clone(), &db_id) {
        Ok(node) => node,
        Err(e) => {
            warn!(%db_id, "Cannot probe database: {e}");
            return;
        }
    };

    let interval = Duration::from_millis(agent.config.healthcheck.interval_ms);
    let minimum_interval = Duration::from_millis(agent.config.healthcheck.minimum_interval_ms);
    let flip_interval = agent.config.healthcheck.online_flip_interval;

    let mut conn: Option<Conn> = None;
    let mut kv: Option<KvClient> = None;
    // None forces an ONLINE-flip check on the next successful probe, so a
    // recovering node heals its config entry promptly.
    let mut last_flip_check: Option<Instant> = None;

    loop {
        if stop.is_cancelled() {
            return;
        }
        let started = Instant::now();

        match probe_once(&node, &mut conn, &mut kv).await {
            Ok(()) => {
                if flip_check_due(last_flip_check, flip_interval) {
                    match ensure_marked_online(&node, kv.as_ref()).await {
                        Ok(checked) => {
                            if checked {
                                last_flip_check = Some(Instant::now());
                            }
                        }
                        Err(e) => {
                            debug!(%db_id, "ONLINE-flip check failed: {e}");
                            kv = None;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(%db_id, "Health probe failed: {e}");
                conn = None;
                // Forget the flip stamp so recovery re-marks the node
                // without waiting out the window.
                last_flip_check = None;
            }
        }

        let elapsed = started.elapsed();
        let wait = interval.saturating_sub(elapsed).max(minimum_interval);
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

async fn probe_once(
    node: &MysqlNode,
    conn: &mut Option<Conn>,
    kv: &mut Option<KvClient>,
) -> Result<(), AgentError> {
    if conn.is_none() {
        *conn = Some(node.db_connection().await?);
    }
    let connection = conn.as_mut().expect("connection just ensured");
    let health = node.health_probe(connection).await?;

    if kv.is_none() {
        *kv = Some(node.kv().await?);
    }
    let client = kv.as_ref().expect("kv client just ensured");
    if let Err(e) = node.publish_health(client, &health).await {
        *kv = None;
        return Err(e);
    }
    Ok(())
}

/// CAS-flips this node back to ONLINE if the config currently says OFFLINE.
/// Returns whether the check completed (reached a conclusion worth stamping).
async fn ensure_marked_online(
    node: &MysqlNode,
    kv: Option<&KvClient>,
) -> Result<bool, AgentError> {
    let Some(kv) = kv else {
        return Ok(false);
    };
    let view = load_cluster_view(kv, &node.record.cluster_id).await?;
    let descriptor = view.node(&node.record.id)?;
    if descriptor.status != NodeStatus::Offline {
        // Already online (or under maintenance); nothing to write.
        return Ok(true);
    }

    let updated = view
        .topology
        .with_status(&node.record.id, NodeStatus::Online);
    let committed = kv
        .cas_version(
            &keys::cluster_config(&node.record.cluster_id),
            view.version,
            updated.to_bytes()?,
        )
        .await?;
    if committed {
        info!(id = %node.record.id, "Marked node ONLINE in cluster config");
        Ok(true)
    } else {
        debug!(
            id = node.record.id,
            "ONLINE flip lost the config race, retrying on a later cycle"
        );
        Ok(false)
    }
}

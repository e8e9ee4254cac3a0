// src/core/monitor/election.rs

//! Master election under the cluster's etcd lock.
//!
//! When a config update shows no online master, the watcher enqueues the
//! cluster here; campaigns never run inline on the watch task. The lock
//! serializes campaigns across agents; within one agent the in-flight set
//! keeps it to one campaign per cluster. Everything after lock acquisition
//! runs behind a scoped guard so the lock is released on every exit path.

use crate::core::agent_state::AgentContext;
use crate::core::cluster::{ClusterView, NodeHealth};
use crate::core::errors::AgentError;
use crate::core::gtid::is_caught_up;
use crate::core::keys;
use crate::core::kv::{KvClient, load_cluster_view, working_credentials};
use crate::domain::proxy_agent_client;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Orders replica candidates for promotion: drop anything behind the failed
/// master's position, then prefer high weight, breaking ties by node id.
pub fn select_candidates(
    view: &ClusterView,
    statuses: &HashMap<String, NodeHealth>,
    master_gtid: &str,
) -> Vec<String> {
    let mut candidates: Vec<String> = view
        .online_replica_ids()
        .into_iter()
        .filter(|id| {
            statuses
                .get(id)
                .is_some_and(|health| is_caught_up(&health.gtid, master_gtid))
        })
        .collect();

    candidates.sort_by(|a, b| {
        let weight_a = view.topology.node(a).map(|n| n.weight).unwrap_or(0);
        let weight_b = view.topology.node(b).map(|n| n.weight).unwrap_or(0);
        weight_b.cmp(&weight_a).then_with(|| a.cmp(b))
    });
    candidates
}

enum CampaignOutcome {
    /// A new master was written into the cluster config.
    Elected(String),
    /// Nothing to do, or the campaign was safely abandoned.
    Done,
    /// Another agent holds the election lock; try again shortly.
    LockBusy,
}

pub struct Elector {
    agent: Arc<AgentContext>,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    in_flight: Mutex<HashSet<String>>,
}

impl Elector {
    pub fn new(agent: Arc<AgentContext>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            agent,
            tx,
            rx: Mutex::new(Some(rx)),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Queues a campaign for a cluster. Cheap and non-blocking; callers are
    /// watch loops that must never stall.
    pub fn enqueue(&self, cluster_id: &str) {
        let _ = self.tx.send(cluster_id.to_string());
    }

    /// Consumes the queue, running at most one campaign per cluster at a
    /// time.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut rx = self
            .rx
            .lock()
            .take()
            .expect("elector run() started twice");
        info!("Elector started");
        loop {
            tokio::select! {
                Some(cluster_id) = rx.recv() => {
                    if !self.in_flight.lock().insert(cluster_id.clone()) {
                        continue;
                    }
                    let elector = self.clone();
                    tokio::spawn(async move {
                        let requeue = elector.campaign(&cluster_id).await;
                        elector.in_flight.lock().remove(&cluster_id);
                        // Re-enqueue only after releasing the in-flight slot,
                        // or the retry would be dropped as a duplicate.
                        if requeue {
                            elector.enqueue(&cluster_id);
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("Elector shutting down");
                    return;
                }
            }
        }
    }

    /// Runs one campaign. Returns whether the cluster should be re-queued
    /// (the election lock was busy).
    async fn campaign(self: &Arc<Self>, cluster_id: &str) -> bool {
        match self.campaign_inner(cluster_id).await {
            Ok(CampaignOutcome::Elected(winner)) => {
                info!(cluster_id, %winner, "New master elected");
                false
            }
            Ok(CampaignOutcome::Done) => false,
            Ok(CampaignOutcome::LockBusy) => true,
            Err(e) => {
                // Abandoned; the next config-change event re-triggers.
                warn!(cluster_id, "Election abandoned: {e}");
                false
            }
        }
    }

    async fn campaign_inner(
        self: &Arc<Self>,
        cluster_id: &str,
    ) -> Result<CampaignOutcome, AgentError> {
        let agent = &self.agent;
        let kv = working_credentials(&agent.config.etcd, &agent.catalog, cluster_id).await?;
        let view = load_cluster_view(&kv, cluster_id).await?;

        if !view.online_master_ids().is_empty() {
            return Ok(CampaignOutcome::Done);
        }
        let Some(offline_master) = view.offline_master_ids().into_iter().next() else {
            return Ok(CampaignOutcome::Done);
        };

        // Last chance to abort cheaply: if the proxy can still reach the
        // offline master, it will mark itself online again shortly.
        let mut proxy_client = proxy_agent_client(agent, &view).await?;
        if proxy_client
            .check_database_reachability(
                cluster_id,
                &offline_master,
                agent.config.monitor.reachability_timeout,
            )
            .await
            .unwrap_or(false)
        {
            info!(cluster_id, %offline_master, "Offline master still reachable, no election");
            return Ok(CampaignOutcome::Done);
        }

        let guard = match kv
            .lock(
                &keys::election_lock(cluster_id),
                agent.config.election.lock_ttl_secs,
                agent.config.election.acquire_timeout,
            )
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                // Another agent is campaigning; queue ourselves behind it.
                info!(cluster_id, "Election lock busy ({e}), re-enqueueing");
                return Ok(CampaignOutcome::LockBusy);
            }
        };

        let result = self
            .campaign_locked(&kv, cluster_id, &offline_master)
            .await;

        if let Err(e) = guard.release().await {
            warn!(cluster_id, "Failed to release election lock: {e}");
        }
        Ok(match result? {
            Some(winner) => CampaignOutcome::Elected(winner),
            None => CampaignOutcome::Done,
        })
    }

    async fn campaign_locked(
        self: &Arc<Self>,
        kv: &KvClient,
        cluster_id: &str,
        offline_master: &str,
    ) -> Result<Option<String>, AgentError> {
        let agent = &self.agent;

        // Re-read under the lock; a rival may have finished already.
        let view = load_cluster_view(kv, cluster_id).await?;
        if !view.online_master_ids().is_empty() {
            return Ok(None);
        }

        let candidates = view.online_replica_ids();
        if candidates.is_empty() {
            info!(cluster_id, "No eligible replicas to promote");
            return Ok(None);
        }

        // Last broadcast positions of the candidates and the failed master.
        let mut status_ids = candidates.clone();
        status_ids.push(offline_master.to_string());
        let mut statuses: HashMap<String, NodeHealth> = HashMap::new();
        for node_id in &status_ids {
            if let Some((data, _)) = kv.get(&keys::node_status(cluster_id, node_id)).await? {
                if let Ok(health) = serde_json::from_slice::<NodeHealth>(&data) {
                    statuses.insert(node_id.clone(), health);
                }
            }
        }

        let Some(master_health) = statuses.get(offline_master) else {
            // Without the failed master's position there is no safe baseline
            // to compare candidates against.
            info!(cluster_id, offline_master, "No health baseline for offline master");
            return Ok(None);
        };
        let master_gtid = master_health.gtid.clone();

        let eligible = select_candidates(&view, &statuses, &master_gtid);

        // The proxy gets the final say on each candidate, best first.
        let mut proxy_client = proxy_agent_client(agent, &view).await?;
        let mut winner = None;
        for candidate in &eligible {
            if proxy_client
                .check_database_reachability(
                    cluster_id,
                    candidate,
                    agent.config.monitor.reachability_timeout,
                )
                .await
                .unwrap_or(false)
            {
                winner = Some(candidate.clone());
                break;
            }
        }
        let Some(winner) = winner else {
            info!(cluster_id, "No reachable candidate to promote");
            return Ok(None);
        };

        // Re-read once more right before the swap.
        let view = load_cluster_view(kv, cluster_id).await?;
        if !view.online_master_ids().is_empty() {
            return Ok(None);
        }

        let updated = view.topology.with_master_swap(&winner, offline_master);
        let committed = kv
            .cas_version(
                &keys::cluster_config(cluster_id),
                view.version,
                updated.to_bytes()?,
            )
            .await?;
        if !committed {
            info!(cluster_id, "Role swap CAS lost to a concurrent update");
            return Ok(None);
        }
        Ok(Some(winner))
    }
}

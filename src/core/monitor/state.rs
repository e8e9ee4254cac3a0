// src/core/monitor/state.rs

//! Per-cluster etcd watchers and the reactions they fan out.
//!
//! One watcher task per cluster with any local service. Config updates
//! refresh the view cache and shared-token table, drive proxy backend
//! reconciliation, and, when the update leaves the cluster without an
//! online master, enqueue an election. Node status updates feed the
//! dead-node detector. Watch transport errors drop the cached credential and
//! re-acquire a working one after a short pause, because the credential that
//! died may belong to a service that is being deleted.

use crate::core::agent_state::AgentContext;
use crate::core::cluster::{ClusterTopology, ClusterView, NodeHealth};
use crate::core::keys::{self, ClusterKey};
use crate::core::kv::{KvClient, working_credentials};
use crate::core::monitor::dead_node::DeadNodeDetector;
use crate::core::monitor::election::Elector;
use crate::core::pubsub::{ETCD_MONITOR_COMMANDS, MonitorCommand};
use crate::domain::proxy::sync_backend_servers_for_cluster;
use etcd_client::EventType;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

struct WatcherHandle {
    stop: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

pub struct StateMonitor {
    agent: Arc<AgentContext>,
    detector: Arc<DeadNodeDetector>,
    elector: Arc<Elector>,
    watchers: Mutex<HashMap<String, WatcherHandle>>,
}

impl StateMonitor {
    pub fn new(
        agent: Arc<AgentContext>,
        detector: Arc<DeadNodeDetector>,
        elector: Arc<Elector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent,
            detector,
            elector,
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// Command listener plus periodic catalog reconciliation.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut commands = self.agent.broker.subscribe(ETCD_MONITOR_COMMANDS);
        let mut sync_tick =
            tokio::time::interval(self.agent.config.monitor.membership_sync_interval);
        info!("State monitor started");

        loop {
            tokio::select! {
                message = commands.recv() => {
                    match message {
                        Ok(raw) => {
                            let Some(command) = MonitorCommand::parse(&raw) else { continue };
                            match command {
                                MonitorCommand::Add(id) | MonitorCommand::Reload(id) => {
                                    self.add_cluster(&id).await;
                                }
                                MonitorCommand::Remove(id) => self.remove_cluster(&id).await,
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "State monitor lagged on commands, resyncing");
                            self.reconcile().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = sync_tick.tick() => {
                    self.reconcile().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("State monitor shutting down");
                    self.stop_all().await;
                    return;
                }
            }
        }
    }

    async fn reconcile(&self) {
        let desired = self.agent.catalog.cluster_ids();
        let current: Vec<String> = self.watchers.lock().await.keys().cloned().collect();

        for id in &desired {
            if !current.contains(id) {
                self.agent
                    .broker
                    .publish_command(ETCD_MONITOR_COMMANDS, "add", id);
            }
        }
        for id in &current {
            if !desired.contains(id) {
                self.agent
                    .broker
                    .publish_command(ETCD_MONITOR_COMMANDS, "remove", id);
            }
        }
    }

    async fn add_cluster(&self, cluster_id: &str) {
        let mut watchers = self.watchers.lock().await;
        if watchers.contains_key(cluster_id) {
            return;
        }
        let stop = CancellationToken::new();
        let handle = tokio::spawn(watch_cluster(
            self.agent.clone(),
            self.detector.clone(),
            self.elector.clone(),
            cluster_id.to_string(),
            stop.clone(),
        ));
        watchers.insert(cluster_id.to_string(), WatcherHandle { stop, handle });
        info!(cluster_id, "Started cluster state watcher");
    }

    async fn remove_cluster(&self, cluster_id: &str) {
        // Another local service may still depend on this cluster.
        if self.agent.catalog.is_cluster_in_use(cluster_id) {
            return;
        }
        let Some(watcher) = self.watchers.lock().await.remove(cluster_id) else {
            return;
        };
        watcher.stop.cancel();
        if tokio::time::timeout(Duration::from_secs(5), watcher.handle)
            .await
            .is_err()
        {
            warn!(cluster_id, "Watcher did not stop within its grace period");
        }
        self.agent.clusters.remove(cluster_id);
        info!(cluster_id, "Stopped cluster state watcher");
    }

    async fn stop_all(&self) {
        let handles: Vec<WatcherHandle> = {
            let mut watchers = self.watchers.lock().await;
            watchers.drain().map(|(_, handle)| handle).collect()
        };
        for watcher in handles {
            watcher.stop.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(5), watcher.handle).await;
        }
    }

    /// Clusters with a live watcher, mainly for introspection and tests.
    pub async fn watched_clusters(&self) -> Vec<String> {
        self.watchers.lock().await.keys().cloned().collect()
    }
}

/// The watch loop for one cluster. Lives until its stop token fires.
async fn watch_cluster(
    agent: Arc<AgentContext>,
    detector: Arc<DeadNodeDetector>,
    elector: Arc<Elector>,
    cluster_id: String,
    stop: CancellationToken,
) {
    let prefix = keys::cluster_prefix(&cluster_id);
    let mut kv: Option<KvClient> = None;

    while !stop.is_cancelled() {
        if kv.is_none() {
            match working_credentials(&agent.config.etcd, &agent.catalog, &cluster_id).await {
                Ok(client) => kv = Some(client),
                Err(e) => {
                    debug!(%cluster_id, "No working etcd credentials yet: {e}");
                    if pause_or_stop(&stop, WATCH_RETRY_DELAY).await {
                        return;
                    }
                    continue;
                }
            }
        }
        let client = kv.as_ref().expect("kv client just ensured");

        let (mut watcher, mut stream) = match client.watch_prefix(&prefix).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(%cluster_id, "Failed to open watch: {e}");
                kv = None;
                if pause_or_stop(&stop, WATCH_RETRY_DELAY).await {
                    return;
                }
                continue;
            }
        };

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    let _ = watcher.cancel().await;
                    return;
                }
                message = stream.message() => {
                    match message {
                        Ok(Some(response)) => {
                            if response.canceled() {
                                break;
                            }
                            for event in response.events() {
                                handle_event(&agent, &detector, &elector, &cluster_id, event)
                                    .await;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(%cluster_id, "Watch stream error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        // The credential that carried this watch may have just been
        // deactivated; start over from the failover helper.
        kv = None;
        if pause_or_stop(&stop, WATCH_RETRY_DELAY).await {
            return;
        }
    }
}

/// Sleeps for `delay`, returning true if the stop token fired meanwhile.
async fn pause_or_stop(stop: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn handle_event(
    agent: &Arc<AgentContext>,
    detector: &Arc<DeadNodeDetector>,
    elector: &Arc<Elector>,
    cluster_id: &str,
    event: &etcd_client::Event,
) {
    if event.event_type() != EventType::Put {
        return;
    }
    let Some(kv) = event.kv() else {
        return;
    };
    let Ok(key) = kv.key_str() else {
        return;
    };

    match keys::classify(cluster_id, key) {
        ClusterKey::Config => {
            let topology = match ClusterTopology::from_slice(kv.value()) {
                Ok(topology) => topology,
                Err(e) => {
                    warn!(cluster_id, "Undecodable cluster config update: {e}");
                    return;
                }
            };
            let view = ClusterView::new(cluster_id, kv.version(), topology);
            agent
                .shared_tokens
                .set(cluster_id, &view.topology.shared_token);

            let needs_election =
                view.online_master_ids().is_empty() && !view.offline_master_ids().is_empty();

            agent.clusters.store(view.clone());
            sync_backend_servers_for_cluster(agent, cluster_id, Some(&view)).await;

            if needs_election {
                // Never campaign inline; the watch loop must not block.
                elector.enqueue(cluster_id);
            }
        }
        ClusterKey::NodeStatus { node_id } => {
            match serde_json::from_slice::<NodeHealth>(kv.value()) {
                Ok(_health) => detector.update(cluster_id, &node_id),
                Err(e) => debug!(cluster_id, %node_id, "Undecodable health report: {e}"),
            }
        }
        ClusterKey::NodeState { .. } | ClusterKey::Other => {}
    }
}

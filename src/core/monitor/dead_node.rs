// src/core/monitor/dead_node.rs

//! Timeout-based liveness judgement over incoming health reports.
//!
//! Every status-key update observed by the state watchers lands in
//! [`DeadNodeDetector::update`]. A node whose reports stop arriving for the
//! configured timeout is moved into the `dead` set and handed to the
//! verifier exactly once; verification results either clear it (recovered)
//! or leave it parked for the retry loop. One mutex totally orders updates
//! against the monitor loop, which is what makes the dead-set transitions
//! race-free.

use crate::core::agent_state::AgentContext;
use crate::core::monitor::verifier;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Default)]
struct DetectorInner {
    last_seen: HashMap<String, Instant>,
    cluster_of: HashMap<String, String>,
    expiry_heap: BinaryHeap<Reverse<(Instant, String)>>,
    dead: HashSet<String>,
    retry: HashSet<String>,
    verifying: HashSet<String>,
}

pub struct DeadNodeDetector {
    timeout: Duration,
    inner: Mutex<DetectorInner>,
}

impl DeadNodeDetector {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            inner: Mutex::new(DetectorInner::default()),
        })
    }

    /// Records a fresh health report for a node. A node that was considered
    /// dead is rehabilitated on the spot.
    pub fn update(&self, cluster_id: &str, node_id: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_seen.insert(node_id.to_string(), now);
        inner
            .cluster_of
            .insert(node_id.to_string(), cluster_id.to_string());
        inner
            .expiry_heap
            .push(Reverse((now + self.timeout, node_id.to_string())));
        if inner.dead.remove(node_id) {
            inner.retry.remove(node_id);
            info!(node_id, "Node recovered");
        }
    }

    /// Called by the verifier when the node turned out to be reachable.
    pub fn mark_alive(&self, node_id: &str) {
        let mut inner = self.inner.lock();
        if inner.dead.remove(node_id) {
            info!(node_id, "Node verified reachable, cleared from dead set");
        }
        inner.retry.remove(node_id);
    }

    /// Called by the verifier when it could not reach a decision; the retry
    /// loop will respawn it.
    pub fn park_for_retry(&self, node_id: &str) {
        let mut inner = self.inner.lock();
        if inner.dead.contains(node_id) {
            inner.retry.insert(node_id.to_string());
        }
    }

    /// Marks a verification attempt finished, allowing a future one.
    pub fn finish_verification(&self, node_id: &str) {
        self.inner.lock().verifying.remove(node_id);
    }

    pub fn is_dead(&self, node_id: &str) -> bool {
        self.inner.lock().dead.contains(node_id)
    }

    pub fn is_parked(&self, node_id: &str) -> bool {
        self.inner.lock().retry.contains(node_id)
    }

    /// Pops every due heap entry and returns the nodes that just became
    /// suspects. Heap entries superseded by a newer report are discarded.
    pub fn collect_suspects(&self, now: Instant) -> Vec<(String, String)> {
        let mut suspects = Vec::new();
        let mut inner = self.inner.lock();
        while let Some(Reverse((deadline, _))) = inner.expiry_heap.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, node_id))) = inner.expiry_heap.pop() else {
                break;
            };
            let stale = inner
                .last_seen
                .get(&node_id)
                .is_none_or(|seen| *seen + self.timeout <= now);
            if !stale || inner.dead.contains(&node_id) {
                continue;
            }
            inner.dead.insert(node_id.clone());
            if !inner.verifying.insert(node_id.clone()) {
                continue;
            }
            match inner.cluster_of.get(&node_id) {
                Some(cluster_id) => {
                    warn!(%node_id, "Node missed its report deadline, verifying");
                    suspects.push((cluster_id.clone(), node_id));
                }
                None => {
                    inner.verifying.remove(&node_id);
                }
            }
        }
        suspects
    }

    /// Nodes parked for retry that have no verification in flight.
    pub fn collect_retries(&self) -> Vec<(String, String)> {
        let mut inner = self.inner.lock();
        let parked: Vec<String> = inner.retry.iter().cloned().collect();
        let mut retries = Vec::new();
        for node_id in parked {
            if !inner.dead.contains(&node_id) {
                inner.retry.remove(&node_id);
                continue;
            }
            if !inner.verifying.insert(node_id.clone()) {
                continue;
            }
            inner.retry.remove(&node_id);
            match inner.cluster_of.get(&node_id) {
                Some(cluster_id) => retries.push((cluster_id.clone(), node_id)),
                None => {
                    inner.verifying.remove(&node_id);
                }
            }
        }
        retries
    }

    /// The 1 Hz monitor loop: expire deadlines, spawn verifications.
    pub async fn run_monitor(
        self: Arc<Self>,
        agent: Arc<AgentContext>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        info!("Dead-node monitor started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for (cluster_id, node_id) in self.collect_suspects(Instant::now()) {
                        verifier::spawn(agent.clone(), self.clone(), cluster_id, node_id);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Dead-node monitor shutting down");
                    return;
                }
            }
        }
    }

    /// The retry loop for verifications that ended inconclusive.
    pub async fn run_retry(
        self: Arc<Self>,
        agent: Arc<AgentContext>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut tick = tokio::time::interval(agent.config.monitor.verify_retry_interval);
        tick.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for (cluster_id, node_id) in self.collect_retries() {
                        verifier::spawn(agent.clone(), self.clone(), cluster_id, node_id);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Dead-node retry loop shutting down");
                    return;
                }
            }
        }
    }
}

// src/core/monitor/verifier.rs

//! Quorum verification of a suspected-dead node.
//!
//! The verdict is reached from the outside in: first the cluster's proxy is
//! asked whether it can still reach the node, then the node's online
//! role-eligible peers vote concurrently. Only a clear shortfall, with fewer
//! than 60% of peers reporting reachable, leads to the node being marked
//! OFFLINE, and that write is a compare-and-swap against the config version
//! the verdict was computed from.

use crate::core::agent_state::AgentContext;
use crate::core::errors::AgentError;
use crate::core::keys;
use crate::core::kv::{load_cluster_view, working_credentials};
use crate::core::monitor::dead_node::DeadNodeDetector;
use crate::domain::{node_agent_client, proxy_agent_client};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Something still reaches the node; clear it from the dead set.
    Alive,
    /// The quorum agreed the node is gone and the config now says OFFLINE.
    MarkedOffline,
    /// The quorum agreed, but another writer got to the config first. The
    /// next config event re-drives convergence; nothing to retry here.
    CasLost,
}

/// The quorum rule: a node survives when at least 60% of its `total` online
/// role-eligible peers report it reachable. With no peers at all there is no
/// quorum to condemn it.
pub fn quorum_reached(reachable: usize, total: usize) -> bool {
    reachable as f64 >= win_threshold(total)
}

fn win_threshold(total: usize) -> f64 {
    total as f64 * 0.6
}

/// Spawns one bounded verification task for a suspect.
pub fn spawn(
    agent: Arc<AgentContext>,
    detector: Arc<DeadNodeDetector>,
    cluster_id: String,
    node_id: String,
) {
    tokio::spawn(async move {
        let bound = agent.config.monitor.verify_timeout;
        let outcome =
            tokio::time::timeout(bound, verify(&agent, &cluster_id, &node_id)).await;
        match outcome {
            Ok(Ok(Verdict::Alive)) => detector.mark_alive(&node_id),
            Ok(Ok(Verdict::MarkedOffline)) => {
                info!(%cluster_id, %node_id, "Node marked OFFLINE in cluster config");
            }
            Ok(Ok(Verdict::CasLost)) => {
                info!(%cluster_id, %node_id, "Offline CAS lost, leaving to the next event");
            }
            Ok(Err(e)) => {
                warn!(%cluster_id, %node_id, "Verification inconclusive: {e}");
                detector.park_for_retry(&node_id);
            }
            Err(_) => {
                warn!(%cluster_id, %node_id, "Verification timed out");
                detector.park_for_retry(&node_id);
            }
        }
        detector.finish_verification(&node_id);
    });
}

async fn verify(
    agent: &Arc<AgentContext>,
    cluster_id: &str,
    node_id: &str,
) -> Result<Verdict, AgentError> {
    let kv = working_credentials(&agent.config.etcd, &agent.catalog, cluster_id).await?;
    let view = Arc::new(load_cluster_view(&kv, cluster_id).await?);
    let reach_timeout = agent.config.monitor.reachability_timeout;

    // Step 1: the proxy's word alone can acquit.
    let mut proxy_client = proxy_agent_client(agent, &view).await?;
    if proxy_client
        .check_database_reachability(cluster_id, node_id, reach_timeout)
        .await
        .unwrap_or(false)
    {
        return Ok(Verdict::Alive);
    }

    // Step 2: fan out to the online role-eligible peers and count votes as
    // they land. Peer errors count as "not reachable from that peer".
    let mut peers: Vec<String> = view
        .online_master_ids()
        .into_iter()
        .chain(view.online_replica_ids())
        .chain(view.online_read_only_ids())
        .filter(|id| id != node_id)
        .collect();
    peers.dedup();

    let total = peers.len();
    let mut reachable = 0usize;

    let mut votes: JoinSet<bool> = JoinSet::new();
    for peer_id in peers {
        let agent = agent.clone();
        let view = view.clone();
        let cluster_id = cluster_id.to_string();
        let node_id = node_id.to_string();
        votes.spawn(async move {
            let Ok(mut client) = node_agent_client(&agent, &view, &peer_id).await else {
                return false;
            };
            client
                .check_database_reachability(&cluster_id, &node_id, reach_timeout)
                .await
                .unwrap_or(false)
        });
    }

    while let Some(vote) = votes.join_next().await {
        if vote.unwrap_or(false) {
            reachable += 1;
            if quorum_reached(reachable, total) {
                votes.abort_all();
                return Ok(Verdict::Alive);
            }
        }
    }

    if quorum_reached(reachable, total) {
        return Ok(Verdict::Alive);
    }

    // Step 3: the quorum condemned it; flip its status at the version this
    // verdict was computed against. A lost race is abandoned, not retried.
    let updated = view.topology.with_status(node_id, crate::core::cluster::NodeStatus::Offline);
    let committed = kv
        .cas_version(
            &keys::cluster_config(cluster_id),
            view.version,
            updated.to_bytes()?,
        )
        .await?;
    Ok(if committed {
        Verdict::MarkedOffline
    } else {
        Verdict::CasLost
    })
}

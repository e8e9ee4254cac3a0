// src/core/keys.rs

//! The etcd key layout shared by every agent of a cluster.

/// Prefix under which all of a cluster's coordination state lives.
pub fn cluster_prefix(cluster_id: &str) -> String {
    format!("/clusters/{cluster_id}")
}

/// The serialized cluster topology. The per-key version counter of this key
/// is the authoritative config version used for compare-and-swap updates.
pub fn cluster_config(cluster_id: &str) -> String {
    format!("/clusters/{cluster_id}/config")
}

/// Reserved.
pub fn cluster_master(cluster_id: &str) -> String {
    format!("/clusters/{cluster_id}/master")
}

/// Lease-backed lock serializing master elections.
pub fn election_lock(cluster_id: &str) -> String {
    format!("/clusters/{cluster_id}/election/lock")
}

/// Per-node health heartbeat key.
pub fn node_status(cluster_id: &str, node_id: &str) -> String {
    format!("/clusters/{cluster_id}/nodes/{node_id}/status")
}

/// Reserved.
pub fn node_state(cluster_id: &str, node_id: &str) -> String {
    format!("/clusters/{cluster_id}/nodes/{node_id}/state")
}

/// Classification of a key observed on a cluster prefix watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterKey {
    Config,
    NodeStatus { node_id: String },
    NodeState { node_id: String },
    Other,
}

/// Parses a watched key back into its meaning within the cluster namespace.
pub fn classify(cluster_id: &str, key: &str) -> ClusterKey {
    let prefix = cluster_prefix(cluster_id);
    let Some(rest) = key.strip_prefix(prefix.as_str()) else {
        return ClusterKey::Other;
    };

    match rest {
        "/config" => ClusterKey::Config,
        _ => {
            if let Some(node_part) = rest.strip_prefix("/nodes/") {
                if let Some(node_id) = node_part.strip_suffix("/status") {
                    return ClusterKey::NodeStatus {
                        node_id: node_id.to_string(),
                    };
                }
                if let Some(node_id) = node_part.strip_suffix("/state") {
                    return ClusterKey::NodeState {
                        node_id: node_id.to_string(),
                    };
                }
            }
            ClusterKey::Other
        }
    }
}

// src/core/cluster.rs

//! Decoded cluster topology snapshots and the per-agent view cache.
//!
//! The serialized topology under `/clusters/{id}/config` is the source of
//! truth; everything here is a derived, immutable decode of one observed
//! version. Mutating accessors return fresh topologies meant to be written
//! back through a compare-and-swap on that version.

use crate::core::errors::AgentError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use strum_macros::{Display, EnumString};

/// Role of a database node inside its cluster. Orthogonal to status.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    Master,
    Replica,
    ReadOnly,
    Standby,
}

/// Liveness status recorded in the cluster config. An offline node keeps its
/// role until an election changes it.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Engine flavor reported in health heartbeats.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DbKind {
    #[default]
    Mariadb,
    Mysql,
}

/// One database node as described by the cluster config.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub ip: String,
    pub agent_port: u16,
    pub db_port: u16,
    pub weight: u32,
    pub role: NodeRole,
    pub status: NodeStatus,
}

/// The proxy front-ending the cluster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    pub id: String,
    pub ip: String,
    pub agent_port: u16,
}

/// Per-node health heartbeat, overwritten on every successful probe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeHealth {
    pub db_kind: DbKind,
    pub reported_at_ms: i64,
    pub gtid: String,
}

/// The decoded value of a cluster's config key.
///
/// Nodes live in a `BTreeMap` so that every derived list is deterministic in
/// node-id order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    pub nodes: BTreeMap<String, NodeDescriptor>,
    pub proxy: ProxyDescriptor,
    pub replication_user: String,
    pub replication_password: String,
    /// Token other agents of this cluster present when calling the
    /// inter-agent service.
    pub shared_token: String,
}

impl ClusterTopology {
    pub fn from_slice(data: &[u8]) -> Result<Self, AgentError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AgentError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(node_id)
    }

    fn filter_ids(&self, role: NodeRole, status: NodeStatus) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.role == role && n.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns a copy with one node's status replaced. Unknown ids yield an
    /// unchanged copy; the CAS layer treats that as a no-op write.
    pub fn with_status(&self, node_id: &str, status: NodeStatus) -> Self {
        let mut copy = self.clone();
        if let Some(node) = copy.nodes.get_mut(node_id) {
            node.status = status;
        }
        copy
    }

    /// Returns a copy with one node's role replaced.
    pub fn with_role(&self, node_id: &str, role: NodeRole) -> Self {
        let mut copy = self.clone();
        if let Some(node) = copy.nodes.get_mut(node_id) {
            node.role = role;
        }
        copy
    }

    /// Returns a copy in which `new_master` takes the Master role and
    /// `old_master` is demoted to Replica. Statuses are left untouched.
    pub fn with_master_swap(&self, new_master: &str, old_master: &str) -> Self {
        let mut copy = self.clone();
        if let Some(node) = copy.nodes.get_mut(new_master) {
            node.role = NodeRole::Master;
        }
        if let Some(node) = copy.nodes.get_mut(old_master) {
            node.role = NodeRole::Replica;
        }
        copy
    }
}

/// One observed `(topology, version)` pair. Immutable.
#[derive(Debug, Clone)]
pub struct ClusterView {
    pub cluster_id: String,
    pub version: i64,
    pub topology: ClusterTopology,
}

impl ClusterView {
    pub fn new(cluster_id: impl Into<String>, version: i64, topology: ClusterTopology) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            version,
            topology,
        }
    }

    pub fn node(&self, node_id: &str) -> Result<&NodeDescriptor, AgentError> {
        self.topology
            .node(node_id)
            .ok_or_else(|| AgentError::NodeNotFound {
                cluster: self.cluster_id.clone(),
                node: node_id.to_string(),
            })
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.topology.nodes.keys().cloned().collect()
    }

    pub fn online_master_ids(&self) -> Vec<String> {
        self.topology.filter_ids(NodeRole::Master, NodeStatus::Online)
    }

    pub fn offline_master_ids(&self) -> Vec<String> {
        self.topology.filter_ids(NodeRole::Master, NodeStatus::Offline)
    }

    pub fn online_replica_ids(&self) -> Vec<String> {
        self.topology.filter_ids(NodeRole::Replica, NodeStatus::Online)
    }

    pub fn offline_replica_ids(&self) -> Vec<String> {
        self.topology.filter_ids(NodeRole::Replica, NodeStatus::Offline)
    }

    pub fn online_read_only_ids(&self) -> Vec<String> {
        self.topology.filter_ids(NodeRole::ReadOnly, NodeStatus::Online)
    }

    pub fn offline_read_only_ids(&self) -> Vec<String> {
        self.topology.filter_ids(NodeRole::ReadOnly, NodeStatus::Offline)
    }

    pub fn online_standby_ids(&self) -> Vec<String> {
        self.topology.filter_ids(NodeRole::Standby, NodeStatus::Online)
    }

    pub fn offline_standby_ids(&self) -> Vec<String> {
        self.topology.filter_ids(NodeRole::Standby, NodeStatus::Offline)
    }

    pub fn proxy(&self) -> &ProxyDescriptor {
        &self.topology.proxy
    }
}

/// In-memory cache of the latest observed view per cluster, written by the
/// state watchers and read by reconcilers and token validation.
#[derive(Debug, Default)]
pub struct ClusterCache {
    views: DashMap<String, Arc<ClusterView>>,
}

impl ClusterCache {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, cluster_id: &str) -> Option<Arc<ClusterView>> {
        self.views.get(cluster_id).map(|v| v.clone())
    }

    /// Stores a view, keeping the freshest version if another writer raced.
    pub fn store(&self, view: ClusterView) {
        let view = Arc::new(view);
        self.views
            .entry(view.cluster_id.clone())
            .and_modify(|existing| {
                if view.version >= existing.version {
                    *existing = view.clone();
                }
            })
            .or_insert_with(|| view.clone());
    }

    pub fn remove(&self, cluster_id: &str) {
        self.views.remove(cluster_id);
    }
}

/// Live table of `cluster_id → shared_token`, seeded from configuration and
/// refreshed whenever a watcher decodes a cluster config.
#[derive(Debug, Default)]
pub struct SharedTokens {
    tokens: parking_lot::RwLock<HashMap<String, String>>,
}

impl SharedTokens {
    pub fn new(seed: HashMap<String, String>) -> Self {
        Self {
            tokens: parking_lot::RwLock::new(seed),
        }
    }

    pub fn get(&self, cluster_id: &str) -> Option<String> {
        self.tokens.read().get(cluster_id).cloned()
    }

    pub fn set(&self, cluster_id: &str, token: &str) {
        self.tokens
            .write()
            .insert(cluster_id.to_string(), token.to_string());
    }

    pub fn remove(&self, cluster_id: &str) {
        self.tokens.write().remove(cluster_id);
    }
}

use rds_agent::core::cluster::{
    ClusterCache, ClusterTopology, ClusterView, NodeDescriptor, NodeRole, NodeStatus,
    ProxyDescriptor,
};
use std::collections::BTreeMap;

fn node(ip: &str, weight: u32, role: NodeRole, status: NodeStatus) -> NodeDescriptor {
    NodeDescriptor {
        ip: ip.to_string(),
        agent_port: 50051,
        db_port: 3306,
        weight,
        role,
        status,
    }
}

fn sample_topology() -> ClusterTopology {
    let mut nodes = BTreeMap::new();
    nodes.insert(
        "m1".to_string(),
        node("10.0.0.1", 30, NodeRole::Master, NodeStatus::Online),
    );
    nodes.insert(
        "r1".to_string(),
        node("10.0.0.2", 10, NodeRole::Replica, NodeStatus::Online),
    );
    nodes.insert(
        "r2".to_string(),
        node("10.0.0.3", 20, NodeRole::Replica, NodeStatus::Offline),
    );
    nodes.insert(
        "ro1".to_string(),
        node("10.0.0.4", 5, NodeRole::ReadOnly, NodeStatus::Online),
    );
    nodes.insert(
        "s1".to_string(),
        node("10.0.0.5", 1, NodeRole::Standby, NodeStatus::Offline),
    );
    ClusterTopology {
        nodes,
        proxy: ProxyDescriptor {
            id: "p1".to_string(),
            ip: "10.0.0.9".to_string(),
            agent_port: 50051,
        },
        replication_user: "repl".to_string(),
        replication_password: "repl-pass".to_string(),
        shared_token: "token".to_string(),
    }
}

fn sample_view() -> ClusterView {
    ClusterView::new("c1", 7, sample_topology())
}

#[test]
fn test_role_status_accessors() {
    let view = sample_view();
    assert_eq!(view.online_master_ids(), vec!["m1"]);
    assert!(view.offline_master_ids().is_empty());
    assert_eq!(view.online_replica_ids(), vec!["r1"]);
    assert_eq!(view.offline_replica_ids(), vec!["r2"]);
    assert_eq!(view.online_read_only_ids(), vec!["ro1"]);
    assert!(view.offline_read_only_ids().is_empty());
    assert!(view.online_standby_ids().is_empty());
    assert_eq!(view.offline_standby_ids(), vec!["s1"]);
}

#[test]
fn test_accessor_ordering_is_deterministic() {
    let mut topology = sample_topology();
    topology.nodes.insert(
        "a-replica".to_string(),
        node("10.0.0.6", 10, NodeRole::Replica, NodeStatus::Online),
    );
    let view = ClusterView::new("c1", 1, topology);
    // BTreeMap keys come out in id order, every time.
    assert_eq!(view.online_replica_ids(), vec!["a-replica", "r1"]);
}

#[test]
fn test_with_status_is_copy_on_write() {
    let view = sample_view();
    let updated = view.topology.with_status("m1", NodeStatus::Offline);
    assert_eq!(updated.nodes["m1"].status, NodeStatus::Offline);
    // The original snapshot is untouched.
    assert_eq!(view.topology.nodes["m1"].status, NodeStatus::Online);
    // Role is orthogonal: going offline does not demote.
    assert_eq!(updated.nodes["m1"].role, NodeRole::Master);
}

#[test]
fn test_with_master_swap_assigns_both_roles() {
    let view = sample_view();
    let swapped = view.topology.with_master_swap("r1", "m1");
    assert_eq!(swapped.nodes["r1"].role, NodeRole::Master);
    assert_eq!(swapped.nodes["m1"].role, NodeRole::Replica);
    // Statuses are preserved by the swap.
    assert_eq!(swapped.nodes["m1"].status, NodeStatus::Online);
}

#[test]
fn test_unknown_node_lookup_fails() {
    let view = sample_view();
    assert!(view.node("nope").is_err());
}

#[test]
fn test_topology_round_trips_through_bytes() {
    let topology = sample_topology();
    let decoded = ClusterTopology::from_slice(&topology.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, topology);
}

#[test]
fn test_cache_prefers_fresher_versions() {
    let cache = ClusterCache::new();
    cache.store(ClusterView::new("c1", 5, sample_topology()));
    // A stale writer cannot clobber a fresher view.
    let mut older = sample_topology();
    older.nodes.get_mut("m1").unwrap().status = NodeStatus::Offline;
    cache.store(ClusterView::new("c1", 3, older));
    assert_eq!(cache.get("c1").unwrap().version, 5);
    assert_eq!(
        cache.get("c1").unwrap().topology.nodes["m1"].status,
        NodeStatus::Online
    );

    cache.remove("c1");
    assert!(cache.get("c1").is_none());
}

use rds_agent::core::cluster::{
    ClusterTopology, ClusterView, DbKind, NodeDescriptor, NodeHealth, NodeRole, NodeStatus,
    ProxyDescriptor,
};
use rds_agent::core::monitor::election::select_candidates;
use std::collections::{BTreeMap, HashMap};

fn node(weight: u32, role: NodeRole, status: NodeStatus) -> NodeDescriptor {
    NodeDescriptor {
        ip: "10.0.0.1".to_string(),
        agent_port: 50051,
        db_port: 3306,
        weight,
        role,
        status,
    }
}

fn health(gtid: &str) -> NodeHealth {
    NodeHealth {
        db_kind: DbKind::Mariadb,
        reported_at_ms: 0,
        gtid: gtid.to_string(),
    }
}

fn view_with(nodes: Vec<(&str, NodeDescriptor)>) -> ClusterView {
    let nodes: BTreeMap<String, NodeDescriptor> = nodes
        .into_iter()
        .map(|(id, node)| (id.to_string(), node))
        .collect();
    ClusterView::new(
        "c1",
        1,
        ClusterTopology {
            nodes,
            proxy: ProxyDescriptor {
                id: "p1".to_string(),
                ip: "10.0.0.9".to_string(),
                agent_port: 50051,
            },
            replication_user: "repl".to_string(),
            replication_password: "pass".to_string(),
            shared_token: "token".to_string(),
        },
    )
}

/// Failed master at 0-1-100; R1 (weight 10) is caught up, R2 (weight 20) is
/// one transaction behind. The stale replica is ineligible regardless of its
/// higher weight.
#[test]
fn test_stale_gtid_disqualifies_heavier_replica() {
    let view = view_with(vec![
        ("m1", node(30, NodeRole::Master, NodeStatus::Offline)),
        ("r1", node(10, NodeRole::Replica, NodeStatus::Online)),
        ("r2", node(20, NodeRole::Replica, NodeStatus::Online)),
    ]);
    let mut statuses = HashMap::new();
    statuses.insert("m1".to_string(), health("0-1-100"));
    statuses.insert("r1".to_string(), health("0-1-100"));
    statuses.insert("r2".to_string(), health("0-1-99"));

    let candidates = select_candidates(&view, &statuses, "0-1-100");
    assert_eq!(candidates, vec!["r1"]);
}

/// Same cluster, but now R2 is the caught-up one: weight ordering picks it
/// over the equally-eligible-but-lighter R1... and R1 is behind anyway.
#[test]
fn test_caught_up_replica_wins_on_weight() {
    let view = view_with(vec![
        ("m1", node(30, NodeRole::Master, NodeStatus::Offline)),
        ("r1", node(10, NodeRole::Replica, NodeStatus::Online)),
        ("r2", node(20, NodeRole::Replica, NodeStatus::Online)),
    ]);
    let mut statuses = HashMap::new();
    statuses.insert("m1".to_string(), health("0-1-100"));
    statuses.insert("r1".to_string(), health("0-1-99"));
    statuses.insert("r2".to_string(), health("0-1-100"));

    let candidates = select_candidates(&view, &statuses, "0-1-100");
    assert_eq!(candidates, vec!["r2"]);
}

#[test]
fn test_weight_ordering_with_node_id_tiebreak() {
    let view = view_with(vec![
        ("m1", node(30, NodeRole::Master, NodeStatus::Offline)),
        ("r-b", node(20, NodeRole::Replica, NodeStatus::Online)),
        ("r-a", node(20, NodeRole::Replica, NodeStatus::Online)),
        ("r-c", node(10, NodeRole::Replica, NodeStatus::Online)),
    ]);
    let mut statuses = HashMap::new();
    for id in ["m1", "r-a", "r-b", "r-c"] {
        statuses.insert(id.to_string(), health("0-1-100"));
    }

    // Heavier first; equal weights break deterministically by node id.
    let candidates = select_candidates(&view, &statuses, "0-1-100");
    assert_eq!(candidates, vec!["r-a", "r-b", "r-c"]);
}

#[test]
fn test_candidates_without_health_reports_are_dropped() {
    let view = view_with(vec![
        ("m1", node(30, NodeRole::Master, NodeStatus::Offline)),
        ("r1", node(10, NodeRole::Replica, NodeStatus::Online)),
        ("r2", node(20, NodeRole::Replica, NodeStatus::Online)),
    ]);
    let mut statuses = HashMap::new();
    statuses.insert("m1".to_string(), health("0-1-100"));
    statuses.insert("r1".to_string(), health("0-1-100"));
    // r2 never reported: no basis to trust it.

    let candidates = select_candidates(&view, &statuses, "0-1-100");
    assert_eq!(candidates, vec!["r1"]);
}

#[test]
fn test_offline_replicas_and_read_only_nodes_are_not_candidates() {
    let view = view_with(vec![
        ("m1", node(30, NodeRole::Master, NodeStatus::Offline)),
        ("r1", node(10, NodeRole::Replica, NodeStatus::Offline)),
        ("ro1", node(50, NodeRole::ReadOnly, NodeStatus::Online)),
        ("s1", node(50, NodeRole::Standby, NodeStatus::Online)),
    ]);
    let mut statuses = HashMap::new();
    for id in ["m1", "r1", "ro1", "s1"] {
        statuses.insert(id.to_string(), health("0-1-100"));
    }

    assert!(select_candidates(&view, &statuses, "0-1-100").is_empty());
}

/// The promotion write must assign both roles: winner to Master, the failed
/// master to Replica, with the failed master's OFFLINE status preserved.
#[test]
fn test_role_swap_promotes_winner_and_demotes_old_master() {
    let view = view_with(vec![
        ("m1", node(30, NodeRole::Master, NodeStatus::Offline)),
        ("r1", node(10, NodeRole::Replica, NodeStatus::Online)),
    ]);
    let swapped = view.topology.with_master_swap("r1", "m1");

    assert_eq!(swapped.nodes["r1"].role, NodeRole::Master);
    assert_eq!(swapped.nodes["r1"].status, NodeStatus::Online);
    assert_eq!(swapped.nodes["m1"].role, NodeRole::Replica);
    assert_eq!(swapped.nodes["m1"].status, NodeStatus::Offline);
}

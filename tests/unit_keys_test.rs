use rds_agent::core::keys::{self, ClusterKey};

#[test]
fn test_key_layout() {
    assert_eq!(keys::cluster_prefix("c1"), "/clusters/c1");
    assert_eq!(keys::cluster_config("c1"), "/clusters/c1/config");
    assert_eq!(keys::cluster_master("c1"), "/clusters/c1/master");
    assert_eq!(keys::election_lock("c1"), "/clusters/c1/election/lock");
    assert_eq!(keys::node_status("c1", "n1"), "/clusters/c1/nodes/n1/status");
    assert_eq!(keys::node_state("c1", "n1"), "/clusters/c1/nodes/n1/state");
}

#[test]
fn test_watch_event_classification() {
    assert_eq!(keys::classify("c1", "/clusters/c1/config"), ClusterKey::Config);
    assert_eq!(
        keys::classify("c1", "/clusters/c1/nodes/n1/status"),
        ClusterKey::NodeStatus {
            node_id: "n1".to_string()
        }
    );
    assert_eq!(
        keys::classify("c1", "/clusters/c1/nodes/n1/state"),
        ClusterKey::NodeState {
            node_id: "n1".to_string()
        }
    );
    assert_eq!(
        keys::classify("c1", "/clusters/c1/election/lock"),
        ClusterKey::Other
    );
    // Keys from another cluster's namespace never classify.
    assert_eq!(
        keys::classify("c1", "/clusters/c2/config"),
        ClusterKey::Other
    );
}

use rds_agent::core::cluster::{
    ClusterTopology, NodeDescriptor, NodeRole, NodeStatus, ProxyDescriptor,
};
use rds_agent::core::reconcile::{
    BackendRow, READER_HOSTGROUP, WRITER_HOSTGROUP, backend_server_statements,
    desired_backend_rows, diff_users, escape_sql, servers_in_sync, user_statements,
};
use std::collections::{BTreeMap, HashMap};

fn node(ip: &str, port: u16, weight: u32, role: NodeRole, status: NodeStatus) -> NodeDescriptor {
    NodeDescriptor {
        ip: ip.to_string(),
        agent_port: 50051,
        db_port: port,
        weight,
        role,
        status,
    }
}

fn topology() -> ClusterTopology {
    let mut nodes = BTreeMap::new();
    nodes.insert(
        "m1".to_string(),
        node("10.0.0.1", 3306, 30, NodeRole::Master, NodeStatus::Online),
    );
    nodes.insert(
        "r1".to_string(),
        node("10.0.0.2", 3306, 10, NodeRole::Replica, NodeStatus::Online),
    );
    nodes.insert(
        "ro1".to_string(),
        node("10.0.0.3", 3306, 5, NodeRole::ReadOnly, NodeStatus::Offline),
    );
    nodes.insert(
        "s1".to_string(),
        node("10.0.0.4", 3306, 1, NodeRole::Standby, NodeStatus::Online),
    );
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
    }
}

#[test]
fn test_desired_rows_map_roles_to_hostgroups() {
    let rows = desired_backend_rows(&topology());
    let expected: Vec<BackendRow> = vec![
        BackendRow {
            hostgroup: WRITER_HOSTGROUP,
            host: "10.0.0.1".to_string(),
            port: 3306,
            weight: 30,
        },
        BackendRow {
            hostgroup: READER_HOSTGROUP,
            host: "10.0.0.2".to_string(),
            port: 3306,
            weight: 10,
        },
        BackendRow {
            hostgroup: READER_HOSTGROUP,
            host: "10.0.0.3".to_string(),
            port: 3306,
            weight: 5,
        },
    ];
    // Standby nodes get no backend row at all.
    assert_eq!(rows.len(), 3);
    for row in expected {
        assert!(rows.contains(&row), "missing row {row:?}");
    }
}

#[test]
fn test_matching_servers_are_a_no_op() {
    let desired = desired_backend_rows(&topology());
    // The proxy reports the same rows in arbitrary order.
    let mut current: Vec<BackendRow> = desired.iter().cloned().collect();
    current.reverse();
    assert!(servers_in_sync(&current, &desired));

    // Applying the desired rows twice derives the identical statement batch:
    // reconciliation is idempotent at the statement level too.
    assert_eq!(
        backend_server_statements(&desired),
        backend_server_statements(&desired_backend_rows(&topology()))
    );
}

#[test]
fn test_server_drift_is_detected() {
    let desired = desired_backend_rows(&topology());
    let mut current: Vec<BackendRow> = desired.iter().cloned().collect();

    // Weight drift on one row.
    current[0].weight += 1;
    assert!(!servers_in_sync(&current, &desired));

    // Extra row.
    let mut extra: Vec<BackendRow> = desired.iter().cloned().collect();
    extra.push(BackendRow {
        hostgroup: READER_HOSTGROUP,
        host: "10.9.9.9".to_string(),
        port: 3306,
        weight: 1,
    });
    assert!(!servers_in_sync(&extra, &desired));

    // Missing row.
    let missing: Vec<BackendRow> = desired.iter().skip(1).cloned().collect();
    assert!(!servers_in_sync(&missing, &desired));
}

#[test]
fn test_server_statement_batch_shape() {
    let statements = backend_server_statements(&desired_backend_rows(&topology()));
    assert_eq!(statements.first().unwrap(), "DELETE FROM mysql_servers");
    assert_eq!(
        statements[statements.len() - 2],
        "LOAD MYSQL SERVERS TO RUNTIME"
    );
    assert_eq!(statements.last().unwrap(), "SAVE MYSQL SERVERS TO DISK");
    // One insert per desired row.
    assert_eq!(statements.len(), 3 + 3);
    assert!(statements[1].starts_with("INSERT INTO mysql_servers"));
}

#[test]
fn test_user_diff_add_update_remove() {
    let db_users = vec![
        ("alice".to_string(), "*HASH_A".to_string()),
        ("bob".to_string(), "*HASH_B2".to_string()),
        ("carol".to_string(), "*HASH_C".to_string()),
    ];
    let mut proxy_users = HashMap::new();
    proxy_users.insert("bob".to_string(), "*HASH_B1".to_string());
    proxy_users.insert("carol".to_string(), "*HASH_C".to_string());
    proxy_users.insert("mallory".to_string(), "*HASH_M".to_string());

    let diff = diff_users(&db_users, &proxy_users);
    assert_eq!(diff.to_add, vec![("alice".to_string(), "*HASH_A".to_string())]);
    assert_eq!(diff.to_update, vec![("bob".to_string(), "*HASH_B2".to_string())]);
    assert_eq!(diff.to_remove, vec!["mallory".to_string()]);
}

#[test]
fn test_empty_diff_emits_no_statements() {
    let db_users = vec![("alice".to_string(), "*HASH_A".to_string())];
    let mut proxy_users = HashMap::new();
    proxy_users.insert("alice".to_string(), "*HASH_A".to_string());

    let diff = diff_users(&db_users, &proxy_users);
    assert!(diff.is_empty());
    // No mutations means not even a LOAD/SAVE round trip.
    assert!(user_statements(&diff).is_empty());
}

#[test]
fn test_user_statements_are_batched() {
    let db_users = vec![
        ("alice".to_string(), "*HASH_A".to_string()),
        ("bob".to_string(), "*HASH_B".to_string()),
    ];
    let proxy_users = HashMap::from([
        ("bob".to_string(), "*OLD".to_string()),
        ("gone".to_string(), "*G".to_string()),
    ]);

    let statements = user_statements(&diff_users(&db_users, &proxy_users));
    // One INSERT, one DELETE, one UPDATE, then LOAD + SAVE: no per-row
    // round trips.
    assert_eq!(statements.len(), 5);
    assert!(statements[0].starts_with("INSERT INTO mysql_users"));
    assert!(statements[0].contains("'alice'"));
    assert!(statements[1].starts_with("DELETE FROM mysql_users"));
    assert!(statements[1].contains("'gone'"));
    assert!(statements[2].starts_with("UPDATE mysql_users SET password = CASE username"));
    assert!(statements[2].contains("WHEN 'bob' THEN '*HASH_B'"));
    assert_eq!(statements[3], "LOAD MYSQL USERS TO RUNTIME");
    assert_eq!(statements[4], "SAVE MYSQL USERS TO DISK");
}

#[test]
fn test_sql_escaping() {
    assert_eq!(escape_sql("plain"), "plain");
    assert_eq!(escape_sql("o'brien"), "o''brien");
    assert_eq!(escape_sql(r"back\slash"), r"back\\slash");
}

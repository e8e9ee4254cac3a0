// src/core/reconcile.rs

//! Pure diff logic for ProxySQL reconciliation.
//!
//! Everything here is deterministic set arithmetic over rows; the proxy
//! domain layer feeds it observed state and executes the statements it
//! produces. Keeping this side-effect free is what makes the idempotence
//! guarantees testable.

use crate::core::cluster::{ClusterTopology, NodeRole};
use std::collections::{BTreeSet, HashMap};

/// Writer hostgroup for masters.
pub const WRITER_HOSTGROUP: u32 = 1;
/// Reader hostgroup for replicas and read-only nodes.
pub const READER_HOSTGROUP: u32 = 2;

/// Users that must never be mirrored into the proxy.
pub const SYSTEM_USER_BLOCKLIST: [&str; 4] =
    ["root", "mysql.sys", "mysql.infoschema", "mysql.session"];

/// One row of `mysql_servers`, normalized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendRow {
    pub hostgroup: u32,
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

/// Escapes a string for embedding in a single-quoted SQL literal. The
/// ProxySQL admin interface does not support prepared statements, so all
/// statements to it are rendered as text.
pub fn escape_sql(input: &str) -> String {
    input.replace('\\', "\\\\").replace('\'', "''")
}

/// Derives the backend rows a topology calls for. Row membership follows
/// role only; status drives election instead, so a node that flaps offline
/// keeps its slot until the cluster config changes its role.
pub fn desired_backend_rows(topology: &ClusterTopology) -> BTreeSet<BackendRow> {
    topology
        .nodes
        .values()
        .filter_map(|node| {
            let hostgroup = match node.role {
                NodeRole::Master => WRITER_HOSTGROUP,
                NodeRole::Replica | NodeRole::ReadOnly => READER_HOSTGROUP,
                NodeRole::Standby => return None,
            };
            Some(BackendRow {
                hostgroup,
                host: node.ip.clone(),
                port: node.db_port,
                weight: node.weight,
            })
        })
        .collect()
}

/// Order-insensitive equality between the proxy's current rows and the
/// desired set.
pub fn servers_in_sync(current: &[BackendRow], desired: &BTreeSet<BackendRow>) -> bool {
    if current.len() != desired.len() {
        return false;
    }
    let current_set: BTreeSet<&BackendRow> = current.iter().collect();
    current_set.len() == desired.len() && desired.iter().all(|row| current_set.contains(row))
}

/// Full statement batch replacing `mysql_servers`. Safe to run against a
/// live proxy: nothing is visible until LOAD ... TO RUNTIME.
pub fn backend_server_statements(desired: &BTreeSet<BackendRow>) -> Vec<String> {
    let mut statements = vec!["DELETE FROM mysql_servers".to_string()];
    for row in desired {
        statements.push(format!(
            "INSERT INTO mysql_servers (hostgroup_id, hostname, port, status, weight) \
             VALUES ({}, '{}', {}, 'ONLINE', {})",
            row.hostgroup,
            escape_sql(&row.host),
            row.port,
            row.weight
        ));
    }
    statements.push("LOAD MYSQL SERVERS TO RUNTIME".to_string());
    statements.push("SAVE MYSQL SERVERS TO DISK".to_string());
    statements
}

/// The three-way difference between the master's user table and the proxy's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDiff {
    pub to_add: Vec<(String, String)>,
    pub to_update: Vec<(String, String)>,
    pub to_remove: Vec<String>,
}

impl UserDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }
}

/// Computes which proxy users must change to mirror `db_users`
/// (username to password-hash pairs read from the master).
pub fn diff_users(
    db_users: &[(String, String)],
    proxy_users: &HashMap<String, String>,
) -> UserDiff {
    let mut diff = UserDiff::default();
    let mut seen = BTreeSet::new();

    for (username, hash) in db_users {
        seen.insert(username.as_str());
        match proxy_users.get(username) {
            None => diff.to_add.push((username.clone(), hash.clone())),
            Some(existing) if existing != hash => {
                diff.to_update.push((username.clone(), hash.clone()))
            }
            Some(_) => {}
        }
    }

    let mut to_remove: Vec<String> = proxy_users
        .keys()
        .filter(|name| !seen.contains(name.as_str()))
        .cloned()
        .collect();
    to_remove.sort();
    diff.to_remove = to_remove;
    diff
}

/// Renders one batched statement per change kind, plus LOAD/SAVE. An empty
/// diff renders nothing at all, not even the LOAD.
pub fn user_statements(diff: &UserDiff) -> Vec<String> {
    if diff.is_empty() {
        return Vec::new();
    }

    let mut statements = Vec::new();

    if !diff.to_add.is_empty() {
        // New users land in the writer hostgroup by default.
        let values: Vec<String> = diff
            .to_add
            .iter()
            .map(|(user, hash)| {
                format!("('{}', '{}', {WRITER_HOSTGROUP})", escape_sql(user), escape_sql(hash))
            })
            .collect();
        statements.push(format!(
            "INSERT INTO mysql_users (username, password, default_hostgroup) VALUES {}",
            values.join(", ")
        ));
    }

    if !diff.to_remove.is_empty() {
        let names: Vec<String> = diff
            .to_remove
            .iter()
            .map(|user| format!("'{}'", escape_sql(user)))
            .collect();
        statements.push(format!(
            "DELETE FROM mysql_users WHERE username IN ({})",
            names.join(", ")
        ));
    }

    if !diff.to_update.is_empty() {
        let cases: Vec<String> = diff
            .to_update
            .iter()
            .map(|(user, hash)| {
                format!("WHEN '{}' THEN '{}'", escape_sql(user), escape_sql(hash))
            })
            .collect();
        let names: Vec<String> = diff
            .to_update
            .iter()
            .map(|(user, _)| format!("'{}'", escape_sql(user)))
            .collect();
        statements.push(format!(
            "UPDATE mysql_users SET password = CASE username {} END WHERE username IN ({})",
            cases.join(" "),
            names.join(", ")
        ));
    }

    statements.push("LOAD MYSQL USERS TO RUNTIME".to_string());
    statements.push("SAVE MYSQL USERS TO DISK".to_string());
    statements
}

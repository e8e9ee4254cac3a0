use rds_agent::config::Config;
use rds_agent::core::util::sha256_hex;
use std::time::Duration;

fn minimal_toml() -> String {
    format!(
        r#"
auth_token_hash = "{}"

[etcd]
endpoints = ["127.0.0.1:2379"]
"#,
        sha256_hex("secret")
    )
}

#[test]
fn test_defaults_are_applied() {
    let config = Config::from_toml_str(&minimal_toml()).unwrap();
    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.port, 50051);
    assert_eq!(config.max_rpc_workers, 10);
    assert_eq!(config.healthcheck.interval_ms, 250);
    assert_eq!(config.healthcheck.minimum_interval_ms, 100);
    assert_eq!(config.healthcheck.online_flip_interval, Duration::from_secs(600));
    assert_eq!(config.monitor.dead_node_timeout, Duration::from_secs(3));
    assert_eq!(config.monitor.verify_timeout, Duration::from_secs(30));
    assert_eq!(config.monitor.verify_retry_interval, Duration::from_secs(30));
    assert_eq!(config.election.lock_ttl_secs, 1800);
    assert_eq!(config.election.acquire_timeout, Duration::from_secs(20));
    assert_eq!(config.reconcile.servers_interval, Duration::from_secs(1800));
    assert_eq!(config.reconcile.users_interval, Duration::from_secs(300));
    assert!(!config.tls.enabled);
}

#[test]
fn test_durations_parse_from_humantime() {
    let toml = format!(
        r#"
auth_token_hash = "{}"

[etcd]
endpoints = ["127.0.0.1:2379"]

[monitor]
dead_node_timeout = "5s"
verify_timeout = "1m"

[reconcile]
servers_interval = "45m"
"#,
        sha256_hex("secret")
    );
    let config = Config::from_toml_str(&toml).unwrap();
    assert_eq!(config.monitor.dead_node_timeout, Duration::from_secs(5));
    assert_eq!(config.monitor.verify_timeout, Duration::from_secs(60));
    assert_eq!(config.reconcile.servers_interval, Duration::from_secs(45 * 60));
}

#[test]
fn test_auth_token_hash_must_be_sha256_hex() {
    let toml = r#"
auth_token_hash = "not-a-digest"

[etcd]
endpoints = ["127.0.0.1:2379"]
"#;
    assert!(Config::from_toml_str(toml).is_err());
}

#[test]
fn test_missing_auth_token_hash_is_rejected() {
    let toml = r#"
[etcd]
endpoints = ["127.0.0.1:2379"]
"#;
    assert!(Config::from_toml_str(toml).is_err());
}

#[test]
fn test_empty_etcd_endpoints_are_rejected() {
    let toml = format!(
        r#"
auth_token_hash = "{}"

[etcd]
endpoints = []
"#,
        sha256_hex("secret")
    );
    assert!(Config::from_toml_str(&toml).is_err());
}

#[test]
fn test_zero_port_is_rejected() {
    let toml = format!(
        r#"
port = 0
auth_token_hash = "{}"

[etcd]
endpoints = ["127.0.0.1:2379"]
"#,
        sha256_hex("secret")
    );
    assert!(Config::from_toml_str(&toml).is_err());
}

#[test]
fn test_tls_requires_paths() {
    let toml = format!(
        r#"
auth_token_hash = "{}"

[etcd]
endpoints = ["127.0.0.1:2379"]

[tls]
enabled = true
cert_path = ""
"#,
        sha256_hex("secret")
    );
    assert!(Config::from_toml_str(&toml).is_err());
}

#[test]
fn test_shared_token_seed_is_loaded() {
    let toml = format!(
        r#"
auth_token_hash = "{}"

[etcd]
endpoints = ["127.0.0.1:2379"]

[cluster_shared_tokens]
c1 = "token-one"
"#,
        sha256_hex("secret")
    );
    let config = Config::from_toml_str(&toml).unwrap();
    assert_eq!(config.cluster_shared_tokens["c1"], "token-one");
}

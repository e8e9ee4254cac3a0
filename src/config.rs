// src/config.rs

//! Manages agent configuration: loading, defaulting, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

/// Configuration for TLS on the RPC listener.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    /// Trusted CA bundle handed to outbound agent clients.
    #[serde(default)]
    pub ca_path: Option<String>,
}

fn default_cert_path() -> String {
    "rds-agent.crt".to_string()
}
fn default_key_path() -> String {
    "rds-agent.key".to_string()
}

/// Connection settings for the etcd cluster backing the coordination plane.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// Timeout for the cheap `status()` probe used during credential failover.
    #[serde(with = "humantime_serde", default = "default_etcd_status_timeout")]
    pub status_timeout: Duration,
    /// Timeout applied to regular get/put/txn calls.
    #[serde(with = "humantime_serde", default = "default_etcd_op_timeout")]
    pub op_timeout: Duration,
}

fn default_etcd_status_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_etcd_op_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            status_timeout: default_etcd_status_timeout(),
            op_timeout: default_etcd_op_timeout(),
        }
    }
}

/// Settings for the per-database health probe loops.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthcheckConfig {
    #[serde(default = "default_healthcheck_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_healthcheck_minimum_interval_ms")]
    pub minimum_interval_ms: u64,
    /// How often a node may attempt to flip itself back ONLINE in the
    /// cluster config. Prevents config-write storms from a flapping node.
    #[serde(with = "humantime_serde", default = "default_online_flip_interval")]
    pub online_flip_interval: Duration,
    /// Timeout for a single SQL probe.
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,
}

fn default_healthcheck_interval_ms() -> u64 {
    250
}
fn default_healthcheck_minimum_interval_ms() -> u64 {
    100
}
fn default_online_flip_interval() -> Duration {
    Duration::from_secs(600)
}
fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_healthcheck_interval_ms(),
            minimum_interval_ms: default_healthcheck_minimum_interval_ms(),
            online_flip_interval: default_online_flip_interval(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

/// Settings for the state watchers and the dead-node machinery.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MonitorConfig {
    /// A node is considered suspect after this long without a health report.
    #[serde(with = "humantime_serde", default = "default_dead_node_timeout")]
    pub dead_node_timeout: Duration,
    /// Wall-clock bound for one full dead-node verification.
    #[serde(with = "humantime_serde", default = "default_verify_timeout")]
    pub verify_timeout: Duration,
    /// How often inconclusive verifications are retried.
    #[serde(with = "humantime_serde", default = "default_verify_retry_interval")]
    pub verify_retry_interval: Duration,
    /// How often monitored db/cluster sets are reconciled from the catalog.
    #[serde(with = "humantime_serde", default = "default_membership_sync_interval")]
    pub membership_sync_interval: Duration,
    /// Timeout for a peer `CheckDatabaseReachability` RPC.
    #[serde(with = "humantime_serde", default = "default_reachability_timeout")]
    pub reachability_timeout: Duration,
}

fn default_dead_node_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_verify_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_verify_retry_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_membership_sync_interval() -> Duration {
    Duration::from_secs(300)
}
fn default_reachability_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            dead_node_timeout: default_dead_node_timeout(),
            verify_timeout: default_verify_timeout(),
            verify_retry_interval: default_verify_retry_interval(),
            membership_sync_interval: default_membership_sync_interval(),
            reachability_timeout: default_reachability_timeout(),
        }
    }
}

/// Settings for the master election protocol.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ElectionConfig {
    #[serde(default = "default_election_lock_ttl_secs")]
    pub lock_ttl_secs: i64,
    #[serde(with = "humantime_serde", default = "default_election_acquire_timeout")]
    pub acquire_timeout: Duration,
}

fn default_election_lock_ttl_secs() -> i64 {
    1800
}
fn default_election_acquire_timeout() -> Duration {
    Duration::from_secs(20)
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_election_lock_ttl_secs(),
            acquire_timeout: default_election_acquire_timeout(),
        }
    }
}

/// Timers for the ProxySQL drift healers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReconcileConfig {
    #[serde(with = "humantime_serde", default = "default_servers_interval")]
    pub servers_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_users_interval")]
    pub users_interval: Duration,
}

fn default_servers_interval() -> Duration {
    Duration::from_secs(1800)
}
fn default_users_interval() -> Duration {
    Duration::from_secs(300)
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            servers_interval: default_servers_interval(),
            users_interval: default_users_interval(),
        }
    }
}

/// Settings for the rsync sidecar used during replica bootstrap.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RsyncConfig {
    #[serde(default = "default_rsync_image")]
    pub image: String,
    #[serde(default = "default_rsync_uid")]
    pub uid: u32,
    #[serde(default = "default_rsync_gid")]
    pub gid: u32,
    /// Timeout for the rsync-control RPCs against the source agent.
    #[serde(with = "humantime_serde", default = "default_rsync_rpc_timeout")]
    pub rpc_timeout: Duration,
}

fn default_rsync_image() -> String {
    "docker.io/tanmoysrt/sshd:latest".to_string()
}
fn default_rsync_uid() -> u32 {
    1000
}
fn default_rsync_gid() -> u32 {
    1000
}
fn default_rsync_rpc_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for RsyncConfig {
    fn default() -> Self {
        Self {
            image: default_rsync_image(),
            uid: default_rsync_uid(),
            gid: default_rsync_gid(),
            rpc_timeout: default_rsync_rpc_timeout(),
        }
    }
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    auth_token_hash: String,
    #[serde(default = "default_max_rpc_workers")]
    max_rpc_workers: usize,
    #[serde(default = "default_data_dir")]
    data_dir: String,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    etcd: EtcdConfig,
    #[serde(default)]
    healthcheck: HealthcheckConfig,
    #[serde(default)]
    monitor: MonitorConfig,
    #[serde(default)]
    election: ElectionConfig,
    #[serde(default)]
    reconcile: ReconcileConfig,
    #[serde(default)]
    rsync: RsyncConfig,
    /// Seed for the cluster shared-token table; the state watchers keep the
    /// live table fresh from the cluster configs themselves.
    #[serde(default)]
    cluster_shared_tokens: HashMap<String, String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    50051
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_rpc_workers() -> usize {
    10
}
fn default_data_dir() -> String {
    "rds_agent_data".to_string()
}

/// Represents the final, validated agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Hex-encoded SHA-256 of the control-plane secret.
    pub auth_token_hash: String,
    pub max_rpc_workers: usize,
    pub data_dir: String,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub healthcheck: HealthcheckConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub rsync: RsyncConfig,
    #[serde(default)]
    pub cluster_shared_tokens: HashMap<String, String>,
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml_str(&contents).with_context(|| format!("Failed to parse TOML from '{path}'"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents)?;

        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            auth_token_hash: raw.auth_token_hash.to_lowercase(),
            max_rpc_workers: raw.max_rpc_workers,
            data_dir: raw.data_dir,
            tls: raw.tls,
            etcd: raw.etcd,
            healthcheck: raw.healthcheck,
            monitor: raw.monitor,
            election: raw.election,
            reconcile: raw.reconcile,
            rsync: raw.rsync,
            cluster_shared_tokens: raw.cluster_shared_tokens,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.auth_token_hash.len() != 64
            || !self.auth_token_hash.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(anyhow!(
                "auth_token_hash must be a hex-encoded SHA-256 digest (64 hex chars)"
            ));
        }
        if self.max_rpc_workers == 0 {
            return Err(anyhow!("max_rpc_workers cannot be 0"));
        }
        if self.data_dir.trim().is_empty() {
            return Err(anyhow!("data_dir cannot be empty"));
        }
        if self.etcd.endpoints.is_empty() {
            return Err(anyhow!("etcd.endpoints cannot be empty"));
        }
        if self.healthcheck.minimum_interval_ms == 0 {
            return Err(anyhow!("healthcheck.minimum_interval_ms cannot be 0"));
        }
        if self.monitor.dead_node_timeout.is_zero() {
            return Err(anyhow!("monitor.dead_node_timeout cannot be 0"));
        }
        if self.election.lock_ttl_secs <= 0 {
            return Err(anyhow!("election.lock_ttl_secs must be positive"));
        }
        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }
        Ok(())
    }
}

// tests/common/mod.rs

//! Shared fixtures for the test suite: a fully wired agent context backed by
//! a temp directory and fake runtimes.

// Each test binary uses a different slice of these helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rds_agent::config::Config;
use rds_agent::core::agent_state::AgentContext;
use rds_agent::core::catalog::{Catalog, ServiceKind, ServiceRecord};
use rds_agent::core::cluster::{ClusterCache, SharedTokens};
use rds_agent::core::errors::AgentError;
use rds_agent::core::jobs::JobStore;
use rds_agent::core::pubsub::Broker;
use rds_agent::core::util::sha256_hex;
use rds_agent::domain::runtime::{
    RsyncSidecarSpec, ServiceRuntime, ServiceState, SidecarRuntime,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const DIRECT_SECRET: &str = "control-plane-secret";

/// A service runtime that records calls and reports everything inactive.
#[derive(Default)]
pub struct FakeServiceRuntime {
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
}

#[async_trait]
impl ServiceRuntime for FakeServiceRuntime {
    async fn start(&self, record: &ServiceRecord) -> Result<(), AgentError> {
        self.started.lock().push(record.id.clone());
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), AgentError> {
        self.stopped.lock().push(id.to_string());
        Ok(())
    }

    async fn restart(&self, _id: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn status(&self, _id: &str) -> Result<ServiceState, AgentError> {
        Ok(ServiceState::Inactive)
    }
}

#[derive(Default)]
pub struct FakeSidecarRuntime {
    pub launched: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

#[async_trait]
impl SidecarRuntime for FakeSidecarRuntime {
    async fn launch_rsync(&self, spec: &RsyncSidecarSpec) -> Result<(), AgentError> {
        self.launched.lock().push(spec.instance_id.clone());
        Ok(())
    }

    async fn exists(&self, instance_id: &str) -> Result<bool, AgentError> {
        Ok(self.launched.lock().contains(&instance_id.to_string()))
    }

    async fn remove(&self, instance_id: &str) -> Result<(), AgentError> {
        self.removed.lock().push(instance_id.to_string());
        Ok(())
    }
}

pub fn test_config(data_dir: &Path) -> Config {
    let toml = format!(
        r#"
host = "127.0.0.1"
port = 50551
auth_token_hash = "{}"
data_dir = "{}"

[etcd]
endpoints = ["127.0.0.1:2379"]
"#,
        sha256_hex(DIRECT_SECRET),
        data_dir.display()
    );
    Config::from_toml_str(&toml).expect("test config must be valid")
}

/// A wired agent context plus handles to its fakes for assertions.
pub struct TestHarness {
    pub agent: Arc<AgentContext>,
    pub service_runtime: Arc<FakeServiceRuntime>,
    pub sidecar_runtime: Arc<FakeSidecarRuntime>,
}

pub fn test_harness(data_dir: &Path) -> TestHarness {
    let config = Arc::new(test_config(data_dir));
    let catalog = Arc::new(Catalog::open(data_dir).unwrap());
    let broker = Arc::new(Broker::new());
    let jobs = Arc::new(JobStore::open(data_dir, broker.clone()).unwrap());
    let (shutdown_tx, _) = broadcast::channel(1);

    let service_runtime = Arc::new(FakeServiceRuntime::default());
    let sidecar_runtime = Arc::new(FakeSidecarRuntime::default());

    let agent = Arc::new(AgentContext {
        config,
        catalog,
        jobs,
        broker,
        clusters: Arc::new(ClusterCache::new()),
        shared_tokens: Arc::new(SharedTokens::new(Default::default())),
        service_runtime: service_runtime.clone(),
        sidecar_runtime: sidecar_runtime.clone(),
        shutdown_tx,
    });

    TestHarness {
        agent,
        service_runtime,
        sidecar_runtime,
    }
}

pub fn test_agent(data_dir: &Path) -> Arc<AgentContext> {
    test_harness(data_dir).agent
}

/// A minimal database record whose metadata decodes as MysqlMetadata.
pub fn sample_db_record(id: &str, cluster_id: &str) -> ServiceRecord {
    ServiceRecord {
        id: id.to_string(),
        service_kind: ServiceKind::Mariadb,
        image: "docker.io/mariadb".to_string(),
        tag: "latest".to_string(),
        mounts: BTreeMap::new(),
        podman_args: vec![],
        metadata: serde_json::json!({
            "root_password": "root-pass",
            "server_id": 42,
            "db_port": 13306,
            "base_path": "/tmp/db",
            "data_path": "/tmp/db/data",
            "config_path": "/tmp/db/config",
            "init_path": "/tmp/db/init",
        }),
        cluster_id: cluster_id.to_string(),
        etcd_username: format!("svc-{id}"),
        etcd_password: "etcd-pass".to_string(),
    }
}

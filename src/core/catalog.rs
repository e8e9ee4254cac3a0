// src/core/catalog.rs

//! The durable catalog of services hosted on this agent.
//!
//! One record per managed unit (database or proxy). The record id doubles as
//! the node id inside cluster configs, so everything the coordination plane
//! does for a node can be traced back to a catalog entry. Persistence is a
//! single JSON file rewritten atomically on every mutation.

use crate::core::errors::AgentError;
use crate::core::kv::EtcdCredential;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString};

/// What kind of unit a record describes.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceKind {
    Mariadb,
    Mysql,
    Proxysql,
}

impl ServiceKind {
    pub fn is_database(self) -> bool {
        matches!(self, ServiceKind::Mariadb | ServiceKind::Mysql)
    }
}

/// A locally hosted service and everything needed to run and coordinate it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub id: String,
    pub service_kind: ServiceKind,
    pub image: String,
    pub tag: String,
    #[serde(default)]
    pub mounts: BTreeMap<String, String>,
    #[serde(default)]
    pub podman_args: Vec<String>,
    /// Kind-specific settings (ports, generated passwords, paths). Decoded
    /// by the domain layer into its typed metadata view.
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub cluster_id: String,
    pub etcd_username: String,
    pub etcd_password: String,
}

impl ServiceRecord {
    pub fn etcd_credential(&self) -> EtcdCredential {
        EtcdCredential {
            username: self.etcd_username.clone(),
            password: self.etcd_password.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct CatalogFile {
    services: BTreeMap<String, ServiceRecord>,
}

/// Thread-safe handle to the service catalog.
#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    inner: Mutex<CatalogFile>,
}

impl Catalog {
    /// Opens (or creates) the catalog file under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, AgentError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("services.json");
        let inner = if path.exists() {
            let contents = std::fs::read(&path)?;
            serde_json::from_slice(&contents)?
        } else {
            CatalogFile::default()
        };
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    fn persist(&self, file: &CatalogFile) -> Result<(), AgentError> {
        let tmp_path = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(file)?;
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn insert(&self, record: ServiceRecord) -> Result<(), AgentError> {
        let mut inner = self.inner.lock();
        if inner.services.contains_key(&record.id) {
            return Err(AgentError::ServiceExists(record.id));
        }
        inner.services.insert(record.id.clone(), record);
        self.persist(&inner)
    }

    pub fn update(&self, record: ServiceRecord) -> Result<(), AgentError> {
        let mut inner = self.inner.lock();
        if !inner.services.contains_key(&record.id) {
            return Err(AgentError::ServiceNotFound(record.id));
        }
        inner.services.insert(record.id.clone(), record);
        self.persist(&inner)
    }

    pub fn remove(&self, id: &str) -> Result<(), AgentError> {
        let mut inner = self.inner.lock();
        if inner.services.remove(id).is_none() {
            return Err(AgentError::ServiceNotFound(id.to_string()));
        }
        self.persist(&inner)
    }

    pub fn get(&self, id: &str) -> Option<ServiceRecord> {
        self.inner.lock().services.get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<ServiceRecord, AgentError> {
        self.get(id)
            .ok_or_else(|| AgentError::ServiceNotFound(id.to_string()))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.inner.lock().services.contains_key(id)
    }

    /// Ids of all locally hosted database instances, in id order.
    pub fn database_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .services
            .values()
            .filter(|r| r.service_kind.is_database())
            .map(|r| r.id.clone())
            .collect()
    }

    /// Ids of all locally hosted proxies, optionally limited to one cluster.
    pub fn proxy_ids(&self, cluster_id: Option<&str>) -> Vec<String> {
        self.inner
            .lock()
            .services
            .values()
            .filter(|r| r.service_kind == ServiceKind::Proxysql)
            .filter(|r| cluster_id.is_none_or(|cid| r.cluster_id == cid))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Distinct cluster ids referenced by any local record. Both databases
    /// and proxies keep their cluster watched.
    pub fn cluster_ids(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut ids: Vec<String> = inner
            .services
            .values()
            .map(|r| r.cluster_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn is_cluster_in_use(&self, cluster_id: &str) -> bool {
        self.inner
            .lock()
            .services
            .values()
            .any(|r| r.cluster_id == cluster_id)
    }

    /// Every etcd credential known for a cluster, in record-id order.
    pub fn credentials_for_cluster(&self, cluster_id: &str) -> Vec<EtcdCredential> {
        self.inner
            .lock()
            .services
            .values()
            .filter(|r| r.cluster_id == cluster_id)
            .map(|r| r.etcd_credential())
            .collect()
    }
}

// src/core/kv.rs

//! Typed facade over the etcd client.
//!
//! Every coordination primitive the agent uses is funneled through here:
//! versioned reads, compare-and-swap config updates, prefix watches, the
//! election lock, and the credential-failover helper. All operations are
//! bounded by the timeouts from [`EtcdConfig`]; nothing in this module blocks
//! indefinitely.

use crate::config::EtcdConfig;
use crate::core::catalog::Catalog;
use crate::core::errors::AgentError;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, LockOptions, Txn, TxnOp, WatchOptions, WatchStream,
    Watcher,
};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// One etcd credential pair owned by a local service record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdCredential {
    pub username: String,
    pub password: String,
}

/// A thin, owned handle to etcd. Cheap to clone; each clone shares the
/// underlying channel.
#[derive(Clone)]
pub struct KvClient {
    client: Client,
    op_timeout: Duration,
}

impl KvClient {
    /// Connects and authenticates against the configured endpoints.
    pub async fn connect(
        etcd: &EtcdConfig,
        credential: &EtcdCredential,
    ) -> Result<Self, AgentError> {
        let options = ConnectOptions::new()
            .with_user(credential.username.clone(), credential.password.clone())
            .with_timeout(etcd.op_timeout)
            .with_connect_timeout(etcd.op_timeout);

        let client = timeout(
            etcd.op_timeout,
            Client::connect(etcd.endpoints.clone(), Some(options)),
        )
        .await??;

        Ok(Self {
            client,
            op_timeout: etcd.op_timeout,
        })
    }

    /// Fetches a key, returning its value and per-key version counter.
    pub async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, i64)>, AgentError> {
        let mut client = self.client.clone();
        let resp = timeout(self.op_timeout, client.get(key, None)).await??;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.version())))
    }

    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), AgentError> {
        let mut client = self.client.clone();
        timeout(self.op_timeout, client.put(key, value, None)).await??;
        Ok(())
    }

    /// Writes `value` only if the key's version counter still equals
    /// `expected_version`. Returns whether the transaction committed; a lost
    /// race is an expected outcome, not an error.
    pub async fn cas_version(
        &self,
        key: &str,
        expected_version: i64,
        value: Vec<u8>,
    ) -> Result<bool, AgentError> {
        let txn = Txn::new()
            .when([Compare::version(key, CompareOp::Equal, expected_version)])
            .and_then([TxnOp::put(key, value, None)]);

        let mut client = self.client.clone();
        let resp = timeout(self.op_timeout, client.txn(txn)).await??;
        if !resp.succeeded() {
            debug!(key, expected_version, "compare-and-swap lost");
        }
        Ok(resp.succeeded())
    }

    /// Opens a prefix watch. The returned `Watcher` cancels the stream when
    /// dropped or explicitly cancelled.
    pub async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> Result<(Watcher, WatchStream), AgentError> {
        let mut client = self.client.clone();
        let (watcher, stream) = timeout(
            self.op_timeout,
            client.watch(prefix, Some(WatchOptions::new().with_prefix())),
        )
        .await??;
        Ok((watcher, stream))
    }

    /// Acquires a lease-backed distributed lock, waiting up to
    /// `acquire_timeout`. The lease keeps the lock bounded even if this
    /// process dies while holding it.
    pub async fn lock(
        &self,
        key: &str,
        ttl_secs: i64,
        acquire_timeout: Duration,
    ) -> Result<LockGuard, AgentError> {
        let mut client = self.client.clone();
        let lease = timeout(self.op_timeout, client.lease_grant(ttl_secs, None)).await??;
        let lease_id = lease.id();

        let lock_resp = match timeout(
            acquire_timeout,
            client.lock(key, Some(LockOptions::new().with_lease(lease_id))),
        )
        .await
        {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                let _ = client.lease_revoke(lease_id).await;
                return Err(e.into());
            }
            Err(_) => {
                let _ = client.lease_revoke(lease_id).await;
                return Err(AgentError::LockNotAcquired(key.to_string()));
            }
        };

        Ok(LockGuard {
            client: self.client.clone(),
            lock_key: lock_resp.key().to_vec(),
            lease_id,
            released: false,
        })
    }

    /// Cheap liveness probe of the store itself, used for credential
    /// failover. Bounded by the caller-provided timeout.
    pub async fn status(&self, probe_timeout: Duration) -> Result<String, AgentError> {
        let mut client = self.client.clone();
        let resp = timeout(probe_timeout, client.status()).await??;
        Ok(resp.version().to_string())
    }
}

/// Scoped ownership of a distributed lock. `release` unlocks and revokes the
/// backing lease; dropping an unreleased guard schedules a best-effort
/// cleanup so an early return cannot strand the lock for the full TTL.
pub struct LockGuard {
    client: Client,
    lock_key: Vec<u8>,
    lease_id: i64,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> Result<(), AgentError> {
        self.released = true;
        let mut client = self.client.clone();
        let unlock = client.unlock(self.lock_key.clone()).await;
        let revoke = client.lease_revoke(self.lease_id).await;
        unlock?;
        revoke?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut client = self.client.clone();
        let lock_key = self.lock_key.clone();
        let lease_id = self.lease_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = client.unlock(lock_key).await {
                    warn!("Failed to unlock dropped lock guard: {e}");
                }
                let _ = client.lease_revoke(lease_id).await;
            });
        }
    }
}

/// Loads and decodes the current cluster config, pairing it with the
/// observed version for later compare-and-swap updates.
pub async fn load_cluster_view(
    kv: &KvClient,
    cluster_id: &str,
) -> Result<crate::core::cluster::ClusterView, AgentError> {
    use crate::core::cluster::{ClusterTopology, ClusterView};
    use crate::core::keys;

    let key = keys::cluster_config(cluster_id);
    let (data, version) = kv
        .get(&key)
        .await?
        .ok_or_else(|| AgentError::ClusterConfigNotFound(cluster_id.to_string()))?;
    let topology = ClusterTopology::from_slice(&data)?;
    Ok(ClusterView::new(cluster_id, version, topology))
}

/// Finds a working etcd credential for a cluster.
///
/// Several local services can belong to the same cluster, each with its own
/// credential; credentials get deactivated while a service is being torn
/// down. Probe each one with `status()` and hand back the first client that
/// answers.
pub async fn working_credentials(
    etcd: &EtcdConfig,
    catalog: &Catalog,
    cluster_id: &str,
) -> Result<KvClient, AgentError> {
    let credentials = catalog.credentials_for_cluster(cluster_id);
    for credential in &credentials {
        match KvClient::connect(etcd, credential).await {
            Ok(client) => match client.status(etcd.status_timeout).await {
                Ok(_) => return Ok(client),
                Err(e) => {
                    debug!(
                        cluster_id,
                        username = %credential.username,
                        "etcd credential probe failed: {e}"
                    );
                }
            },
            Err(e) => {
                debug!(
                    cluster_id,
                    username = %credential.username,
                    "etcd connect failed: {e}"
                );
            }
        }
    }
    Err(AgentError::NoWorkingCredentials(cluster_id.to_string()))
}

// src/core/agent_state.rs

//! The shared state handle threaded through every component of the agent.

use crate::config::Config;
use crate::core::catalog::Catalog;
use crate::core::cluster::{ClusterCache, SharedTokens};
use crate::core::jobs::JobStore;
use crate::core::pubsub::Broker;
use crate::domain::runtime::{ServiceRuntime, SidecarRuntime};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Everything long-lived and shared: configuration, durable stores, caches,
/// the broker, the collaborator runtimes, and the shutdown channel.
///
/// Constructed exactly once at startup and passed down as an `Arc`; there is
/// no process-global configuration.
pub struct AgentContext {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub jobs: Arc<JobStore>,
    pub broker: Arc<Broker>,
    pub clusters: Arc<ClusterCache>,
    pub shared_tokens: Arc<SharedTokens>,
    pub service_runtime: Arc<dyn ServiceRuntime>,
    pub sidecar_runtime: Arc<dyn SidecarRuntime>,
    /// Flipped once on SIGINT/SIGTERM or fatal background failure; every
    /// loop holds a receiver.
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AgentContext {
    pub fn shutdown_rx(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signals every background loop to wind down.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

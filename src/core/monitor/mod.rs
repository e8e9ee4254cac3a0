// src/core/monitor/mod.rs

//! The agent's background coordination loops: health reporting, cluster
//! state watching, dead-node detection and verification, master election,
//! and the periodic ProxySQL drift healers.

pub mod dead_node;
pub mod election;
pub mod health;
pub mod state;
pub mod verifier;

use crate::core::agent_state::AgentContext;
use crate::domain::proxy::{sync_backend_servers_for_all, sync_users_for_all};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Heals proxy backend-server drift on a slow timer, independent of events.
pub async fn run_server_reconcile_timer(
    agent: Arc<AgentContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(agent.config.reconcile.servers_interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                sync_backend_servers_for_all(&agent).await;
            }
            _ = shutdown_rx.recv() => {
                info!("Backend-server reconcile timer shutting down");
                return;
            }
        }
    }
}

/// Heals proxy user drift on a faster timer.
pub async fn run_user_reconcile_timer(
    agent: Arc<AgentContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(agent.config.reconcile.users_interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                sync_users_for_all(&agent).await;
            }
            _ = shutdown_rx.recv() => {
                info!("User reconcile timer shutting down");
                return;
            }
        }
    }
}

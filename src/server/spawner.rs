// src/server/spawner.rs

//! Spawns all of the agent's long-running background tasks.

use super::context::ServerContext;
use crate::core::monitor::dead_node::DeadNodeDetector;
use crate::core::monitor::election::Elector;
use crate::core::monitor::health::HealthMonitor;
use crate::core::monitor::state::StateMonitor;
use crate::core::monitor::{run_server_reconcile_timer, run_user_reconcile_timer};
use tracing::info;

/// Spawns every background loop into the context's JoinSet. Each loop holds
/// its own shutdown receiver; the JoinSet lets the accept loop notice a loop
/// dying early.
pub fn spawn_all(ctx: &mut ServerContext) {
    let agent = ctx.agent.clone();

    let detector = DeadNodeDetector::new(agent.config.monitor.dead_node_timeout);
    let elector = Elector::new(agent.clone());
    let state_monitor = StateMonitor::new(agent.clone(), detector.clone(), elector.clone());
    let health_monitor = HealthMonitor::new(agent.clone());

    // --- Election queue consumer ---
    ctx.background_tasks
        .spawn(elector.clone().run(agent.shutdown_rx()));

    // --- Dead-node detection ---
    ctx.background_tasks
        .spawn(detector.clone().run_monitor(agent.clone(), agent.shutdown_rx()));
    ctx.background_tasks
        .spawn(detector.run_retry(agent.clone(), agent.shutdown_rx()));

    // --- Cluster state watchers + health probes ---
    ctx.background_tasks
        .spawn(state_monitor.run(agent.shutdown_rx()));
    ctx.background_tasks
        .spawn(health_monitor.run(agent.shutdown_rx()));

    // --- Job engine ---
    ctx.background_tasks
        .spawn(ctx.engine.clone().run(agent.shutdown_rx()));

    // --- ProxySQL drift healers ---
    ctx.background_tasks
        .spawn(run_server_reconcile_timer(agent.clone(), agent.shutdown_rx()));
    ctx.background_tasks
        .spawn(run_user_reconcile_timer(agent.clone(), agent.shutdown_rx()));

    info!("All background tasks spawned");
}

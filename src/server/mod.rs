// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use tracing::info;

mod connection_loop;
mod context;
mod initialization;
mod spawner;

pub mod auth;
pub mod dispatch;

/// The main agent startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Build shared state, stores, the handler registry, TLS, listener.
    let mut server_context = initialization::setup(config).await?;

    // 2. Spawn all background coordination loops.
    spawner::spawn_all(&mut server_context);

    // 3. Route SIGINT/SIGTERM into the shutdown channel.
    install_signal_handlers(&server_context);

    // 4. Accept connections until shutdown.
    connection_loop::run(server_context).await
}

fn install_signal_handlers(ctx: &context::ServerContext) {
    let agent = ctx.agent.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        tracing::error!("Cannot install SIGTERM handler: {e}");
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received interrupt, shutting down");
        }
        agent.trigger_shutdown();
    });
}

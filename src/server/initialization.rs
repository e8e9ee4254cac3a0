// src/server/initialization.rs

//! Builds the shared agent context and binds the RPC listener.
//!
//! Anything that fails here is fatal: the process exits with code 1 rather
//! than limping along without its stores, certificates, or port.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::agent_state::AgentContext;
use crate::core::catalog::Catalog;
use crate::core::cluster::{ClusterCache, SharedTokens};
use crate::core::jobs::JobStore;
use crate::core::jobs::worker::JobEngine;
use crate::core::pubsub::Broker;
use crate::domain::runtime::{PodmanRuntime, SystemdRuntime};
use crate::services;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tracing::info;

/// Initializes all server components before the accept loop starts.
pub async fn setup(config: Config) -> Result<ServerContext> {
    let config = Arc::new(config);
    let data_dir = Path::new(&config.data_dir);

    let catalog = Arc::new(
        Catalog::open(data_dir).context("Failed to open the local service catalog")?,
    );
    let broker = Arc::new(Broker::new());
    let jobs = Arc::new(
        JobStore::open(data_dir, broker.clone()).context("Failed to open the job store")?,
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    let agent = Arc::new(AgentContext {
        config: config.clone(),
        catalog,
        jobs,
        broker,
        clusters: Arc::new(ClusterCache::new()),
        shared_tokens: Arc::new(SharedTokens::new(config.cluster_shared_tokens.clone())),
        service_runtime: Arc::new(SystemdRuntime::new()),
        sidecar_runtime: Arc::new(PodmanRuntime),
        shutdown_tx,
    });

    let engine = JobEngine::new(agent.clone());
    let registry = Arc::new(services::build_registry(&agent, &engine));
    engine.set_registry(registry.clone());
    info!("Handler registry built");

    let acceptor = setup_tls(&config).context("Failed to load TLS certificates")?;

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind RPC listener on {}:{}", config.host, config.port))?;
    info!("Agent RPC listening on {}:{}", config.host, config.port);

    let handler_permits = Arc::new(Semaphore::new(config.max_rpc_workers));

    Ok(ServerContext {
        agent,
        registry,
        engine,
        listener,
        acceptor,
        handler_permits,
        background_tasks: JoinSet::new(),
        fatal: Arc::new(AtomicBool::new(false)),
    })
}

fn setup_tls(config: &Config) -> Result<Option<TlsAcceptor>> {
    if !config.tls.enabled {
        return Ok(None);
    }

    let cert_file = std::fs::File::open(&config.tls.cert_path)
        .with_context(|| format!("Cannot open cert file '{}'", config.tls.cert_path))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<std::result::Result<_, _>>()
        .context("Cannot parse certificate chain")?;

    let key_file = std::fs::File::open(&config.tls.key_path)
        .with_context(|| format!("Cannot open key file '{}'", config.tls.key_path))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .context("Cannot parse private key")?
        .context("No private key found")?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid certificate/key pair")?;

    info!("TLS enabled on the RPC listener");
    Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
}

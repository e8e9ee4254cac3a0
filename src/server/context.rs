// src/server/context.rs

use crate::core::agent_state::AgentContext;
use crate::core::jobs::worker::JobEngine;
use crate::server::dispatch::ServiceRegistry;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

/// Everything the running server needs, assembled by `initialization::setup`.
pub struct ServerContext {
    pub agent: Arc<AgentContext>,
    pub registry: Arc<ServiceRegistry>,
    pub engine: Arc<JobEngine>,
    pub listener: TcpListener,
    pub acceptor: Option<TlsAcceptor>,
    /// Bounds concurrently executing handlers across all connections.
    pub handler_permits: Arc<Semaphore>,
    pub background_tasks: JoinSet<()>,
    /// Set when a critical background task died; turns shutdown into exit 1.
    pub fatal: Arc<AtomicBool>,
}

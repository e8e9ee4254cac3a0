// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the agent.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("KV store error: {0}")]
    Kv(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("Serialization error: {0}")]
    Serde(String),

    #[error("No working etcd credentials for cluster '{0}'")]
    NoWorkingCredentials(String),

    #[error("Cluster config not found for cluster '{0}'")]
    ClusterConfigNotFound(String),

    #[error("Node '{node}' not found in cluster '{cluster}'")]
    NodeNotFound { cluster: String, node: String },

    #[error("Service with id '{0}' does not exist")]
    ServiceNotFound(String),

    #[error("Service with id '{0}' already exists")]
    ServiceExists(String),

    #[error("Job {0} not found")]
    JobNotFound(u64),

    #[error("Compare-and-swap lost on key '{0}'")]
    CasConflict(String),

    #[error("Failed to acquire lock '{0}'")]
    LockNotAcquired(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Service runtime error: {0}")]
    Runtime(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("RPC failed with {code}: {message}")]
    Rpc { code: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io(Arc::new(e))
    }
}

impl From<etcd_client::Error> for AgentError {
    fn from(e: etcd_client::Error) -> Self {
        AgentError::Kv(e.to_string())
    }
}

impl From<mysql_async::Error> for AgentError {
    fn from(e: mysql_async::Error) -> Self {
        AgentError::Sql(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serde(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for AgentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AgentError::Timeout("operation exceeded its deadline".to_string())
    }
}

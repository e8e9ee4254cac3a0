// src/services/proxy.rs

//! Lifecycle RPCs for locally hosted ProxySQL instances.

use crate::core::agent_state::AgentContext;
use crate::core::catalog::{ServiceKind, ServiceRecord};
use crate::core::errors::AgentError;
use crate::core::kv::{EtcdCredential, KvClient, load_cluster_view};
use crate::core::pubsub::ETCD_MONITOR_COMMANDS;
use crate::core::util::{find_available_port, random_string};
use crate::domain::proxy::{ProxyMetadata, ProxyNode};
use crate::rpc::SERVICE_PROXY;
use crate::server::dispatch::ServiceRegistry;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Deserialize)]
struct CreateRequest {
    #[serde(default)]
    id: Option<String>,
    cluster_id: String,
    base_path: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    db_readwrite_port: Option<u16>,
    #[serde(default)]
    db_readonly_port: Option<u16>,
    etcd_username: String,
    etcd_password: String,
}

#[derive(Deserialize)]
struct IdRequest {
    id: String,
}

#[derive(Deserialize)]
struct UpgradeRequest {
    id: String,
    image: String,
    tag: String,
}

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, AgentError> {
    serde_json::from_value(payload)
        .map_err(|e| AgentError::InvalidArgument(format!("malformed request: {e}")))
}

async fn info_response(agent: &Arc<AgentContext>, proxy: &ProxyNode) -> Value {
    let status = agent
        .service_runtime
        .status(&proxy.record.id)
        .await
        .map(|s| s.to_string())
        .unwrap_or_else(|_| "FAILED".to_string());
    json!({
        "id": proxy.record.id,
        "cluster_id": proxy.record.cluster_id,
        "image": proxy.record.image,
        "tag": proxy.record.tag,
        "db_readwrite_port": proxy.meta.db_readwrite_port,
        "db_readonly_port": proxy.meta.db_readonly_port,
        "base_path": proxy.meta.base_path,
        "status": status,
    })
}

async fn status_response(agent: &Arc<AgentContext>, id: &str) -> Result<Value, AgentError> {
    let status = agent.service_runtime.status(id).await?;
    Ok(json!({ "status": status.to_string() }))
}

async fn create(agent: Arc<AgentContext>, request: CreateRequest) -> Result<Value, AgentError> {
    if request.cluster_id.is_empty() {
        return Err(AgentError::InvalidArgument("cluster_id is required".into()));
    }
    if request.base_path.is_empty() {
        return Err(AgentError::InvalidArgument("base_path is required".into()));
    }
    if request.etcd_username.is_empty() || request.etcd_password.is_empty() {
        return Err(AgentError::InvalidArgument(
            "etcd_username and etcd_password are required".into(),
        ));
    }

    let id = request.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if agent.catalog.exists(&id) {
        return Err(AgentError::ServiceExists(id));
    }

    let credential = EtcdCredential {
        username: request.etcd_username.clone(),
        password: request.etcd_password.clone(),
    };
    let kv = KvClient::connect(&agent.config.etcd, &credential).await?;
    load_cluster_view(&kv, &request.cluster_id).await?;

    let base = Path::new(&request.base_path);
    let data_path = base.join("data");
    std::fs::create_dir_all(&data_path)?;
    let config_path = base.join("proxysql.cnf");

    let mut taken = HashSet::new();
    let db_readwrite_port = match request.db_readwrite_port {
        Some(port) => port,
        None => find_available_port(0, 30000, &taken)?,
    };
    taken.insert(db_readwrite_port);
    let db_readonly_port = match request.db_readonly_port {
        Some(port) => port,
        None => find_available_port(db_readwrite_port, 30000, &taken)?,
    };
    if db_readwrite_port == db_readonly_port {
        return Err(AgentError::InvalidArgument(
            "db_readwrite_port and db_readonly_port must be different".into(),
        ));
    }
    taken.insert(db_readonly_port);
    let admin_port = find_available_port(0, 30000, &taken)?;

    let meta = ProxyMetadata {
        admin_port,
        admin_password: random_string(16),
        monitor_password: random_string(16),
        db_readwrite_port,
        db_readonly_port,
        base_path: request.base_path.clone(),
        data_path: data_path.to_string_lossy().into_owned(),
        config_path: config_path.to_string_lossy().into_owned(),
    };

    let mut mounts = BTreeMap::new();
    mounts.insert(meta.data_path.clone(), "/var/lib/proxysql".to_string());
    mounts.insert(meta.config_path.clone(), "/etc/proxysql.cnf".to_string());

    let record = ServiceRecord {
        id: id.clone(),
        service_kind: ServiceKind::Proxysql,
        image: request
            .image
            .unwrap_or_else(|| "docker.io/proxysql/proxysql".to_string()),
        tag: request.tag.unwrap_or_else(|| "latest".to_string()),
        mounts,
        podman_args: vec!["--userns=keep-id".to_string()],
        metadata: serde_json::to_value(&meta)?,
        cluster_id: request.cluster_id.clone(),
        etcd_username: request.etcd_username,
        etcd_password: request.etcd_password,
    };
    agent.catalog.insert(record)?;

    agent
        .broker
        .publish_command(ETCD_MONITOR_COMMANDS, "add", &request.cluster_id);

    info!(%id, cluster_id = %request.cluster_id, "Proxy service created");
    let proxy = ProxyNode::load(agent.clone(), &id)?;
    Ok(info_response(&agent, &proxy).await)
}

pub fn register(registry: &mut ServiceRegistry, agent: &Arc<AgentContext>) {
    let ctx = agent.clone();
    registry.register(SERVICE_PROXY, "Create", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move { create(agent, parse(payload)?).await }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_PROXY, "Get", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            let proxy = ProxyNode::load(agent.clone(), &request.id)?;
            Ok(info_response(&agent, &proxy).await)
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_PROXY, "Status", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            agent.catalog.require(&request.id)?;
            status_response(&agent, &request.id).await
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_PROXY, "Start", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            let proxy = ProxyNode::load(agent.clone(), &request.id)?;
            agent.service_runtime.start(&proxy.record).await?;
            status_response(&agent, &request.id).await
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_PROXY, "Stop", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            agent.catalog.require(&request.id)?;
            agent.service_runtime.stop(&request.id).await?;
            status_response(&agent, &request.id).await
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_PROXY, "Restart", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            agent.catalog.require(&request.id)?;
            agent.service_runtime.restart(&request.id).await?;
            status_response(&agent, &request.id).await
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_PROXY, "Delete", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            let proxy = ProxyNode::load(agent.clone(), &request.id)?;
            let state = agent.service_runtime.status(&request.id).await?;
            if state == crate::domain::runtime::ServiceState::Active {
                return Err(AgentError::InvalidState(
                    "service is running, stop it before deleting".to_string(),
                ));
            }
            agent.catalog.remove(&request.id)?;
            agent.broker.publish_command(
                ETCD_MONITOR_COMMANDS,
                "remove",
                &proxy.record.cluster_id,
            );
            info!(id = %request.id, "Proxy service deleted");
            Ok(json!({ "deleted": true }))
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_PROXY, "Upgrade", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: UpgradeRequest = parse(payload)?;
            let mut record = agent.catalog.require(&request.id)?;
            record.image = request.image;
            record.tag = request.tag;
            agent.catalog.update(record)?;
            let proxy = ProxyNode::load(agent.clone(), &request.id)?;
            Ok(info_response(&agent, &proxy).await)
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_PROXY, "SyncUsers", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            let proxy = ProxyNode::load(agent.clone(), &request.id)?;
            let outcome = proxy.sync_users().await?;
            Ok(json!({
                "added_users": outcome.added,
                "removed_users": outcome.removed,
                "updated_users": outcome.updated,
            }))
        }
    });

    let ctx = agent.clone();
    registry.register(
        SERVICE_PROXY,
        "GetMonitorCredential",
        true,
        move |_ctx, payload| {
            let agent = ctx.clone();
            async move {
                let request: IdRequest = parse(payload)?;
                let proxy = ProxyNode::load(agent.clone(), &request.id)?;
                let (username, password) = proxy.monitor_credential();
                Ok(json!({ "username": username, "password": password }))
            }
        },
    );
}

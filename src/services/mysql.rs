// src/services/mysql.rs

//! Lifecycle RPCs for locally hosted MySQL/MariaDB instances.
//!
//! Every method here supports the async-job metadata, so the control plane
//! can fire long operations (replica bootstrap, upgrades) and follow them
//! over `Job/Listen`.

use crate::core::agent_state::AgentContext;
use crate::core::catalog::{ServiceKind, ServiceRecord};
use crate::core::errors::AgentError;
use crate::core::kv::{EtcdCredential, KvClient, load_cluster_view};
use crate::core::pubsub::{ETCD_MONITOR_COMMANDS, MYSQL_MONITOR_COMMANDS};
use crate::core::util::find_available_port;
use crate::domain::mysql::{MysqlMetadata, MysqlNode};
use crate::rpc::SERVICE_MYSQL;
use crate::server::dispatch::ServiceRegistry;
use rand::Rng;
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
    server_id: Option<u32>,
    #[serde(default)]
    db_port: Option<u16>,
    #[serde(default)]
    service: Option<String>,
    root_password: String,
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

async fn info_response(agent: &Arc<AgentContext>, node: &MysqlNode) -> Value {
    let status = agent
        .service_runtime
        .status(&node.record.id)
        .await
        .map(|s| s.to_string())
        .unwrap_or_else(|_| "FAILED".to_string());
    json!({
        "id": node.record.id,
        "cluster_id": node.record.cluster_id,
        "image": node.record.image,
        "tag": node.record.tag,
        "server_id": node.meta.server_id,
        "db_port": node.meta.db_port,
        "service": node.record.service_kind.to_string(),
        "base_path": node.meta.base_path,
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
    let service_kind = match request.service.as_deref() {
        None | Some("mariadb") => ServiceKind::Mariadb,
        Some("mysql") => ServiceKind::Mysql,
        Some(other) => {
            return Err(AgentError::InvalidArgument(format!(
                "unknown service '{other}'"
            )));
        }
    };

    let id = request.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if agent.catalog.exists(&id) {
        return Err(AgentError::ServiceExists(id));
    }

    // The cluster must already exist (and have a proxy) before databases
    // join it; this also proves the handed-over credential works.
    let credential = EtcdCredential {
        username: request.etcd_username.clone(),
        password: request.etcd_password.clone(),
    };
    let kv = KvClient::connect(&agent.config.etcd, &credential).await?;
    load_cluster_view(&kv, &request.cluster_id).await?;

    let base = Path::new(&request.base_path);
    let data_path = base.join("data");
    let config_path = base.join("config");
    let init_path = base.join("init");
    for dir in [&data_path, &config_path, &init_path] {
        std::fs::create_dir_all(dir)?;
    }

    let db_port = match request.db_port {
        Some(port) => port,
        None => find_available_port(0, 30000, &HashSet::new())?,
    };
    let server_id = request
        .server_id
        .unwrap_or_else(|| rand::thread_rng().gen_range(1..=1_000_000));

    let meta = MysqlMetadata {
        root_password: request.root_password,
        server_id,
        db_port,
        base_path: request.base_path.clone(),
        data_path: data_path.to_string_lossy().into_owned(),
        config_path: config_path.to_string_lossy().into_owned(),
        init_path: init_path.to_string_lossy().into_owned(),
    };

    let mut mounts = BTreeMap::new();
    mounts.insert(meta.data_path.clone(), "/var/lib/mysql".to_string());
    mounts.insert(meta.config_path.clone(), "/etc/mysql/conf.d".to_string());
    mounts.insert(
        meta.init_path.clone(),
        "/docker-entrypoint-initdb.d".to_string(),
    );

    let record = ServiceRecord {
        id: id.clone(),
        service_kind,
        image: request
            .image
            .unwrap_or_else(|| "docker.io/mariadb".to_string()),
        tag: request.tag.unwrap_or_else(|| "latest".to_string()),
        mounts,
        podman_args: vec!["--userns=keep-id:uid=999,gid=999".to_string()],
        metadata: serde_json::to_value(&meta)?,
        cluster_id: request.cluster_id.clone(),
        etcd_username: request.etcd_username,
        etcd_password: request.etcd_password,
    };
    agent.catalog.insert(record)?;

    // Wake the monitors up for the new member.
    agent
        .broker
        .publish_command(MYSQL_MONITOR_COMMANDS, "add", &id);
    agent
        .broker
        .publish_command(ETCD_MONITOR_COMMANDS, "add", &request.cluster_id);

    info!(%id, cluster_id = %request.cluster_id, "Database service created");
    let node = MysqlNode::load(agent.clone(), &id)?;
    Ok(info_response(&agent, &node).await)
}

async fn delete(agent: Arc<AgentContext>, id: &str) -> Result<Value, AgentError> {
    let node = MysqlNode::load(agent.clone(), id)?;
    let state = agent.service_runtime.status(id).await?;
    if state == crate::domain::runtime::ServiceState::Active {
        return Err(AgentError::InvalidState(
            "service is running, stop it before deleting".to_string(),
        ));
    }
    agent.catalog.remove(id)?;
    agent
        .broker
        .publish_command(MYSQL_MONITOR_COMMANDS, "remove", id);
    agent
        .broker
        .publish_command(ETCD_MONITOR_COMMANDS, "remove", &node.record.cluster_id);
    // Data directories stay on disk; cleanup is a provisioning concern.
    info!(id, "Database service deleted");
    Ok(json!({ "deleted": true }))
}

pub fn register(registry: &mut ServiceRegistry, agent: &Arc<AgentContext>) {
    let ctx = agent.clone();
    registry.register(SERVICE_MYSQL, "Create", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move { create(agent, parse(payload)?).await }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_MYSQL, "Get", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            let node = MysqlNode::load(agent.clone(), &request.id)?;
            Ok(info_response(&agent, &node).await)
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_MYSQL, "Status", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            agent.catalog.require(&request.id)?;
            status_response(&agent, &request.id).await
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_MYSQL, "Start", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            let node = MysqlNode::load(agent.clone(), &request.id)?;
            agent.service_runtime.start(&node.record).await?;
            status_response(&agent, &request.id).await
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_MYSQL, "Stop", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            agent.catalog.require(&request.id)?;
            agent.service_runtime.stop(&request.id).await?;
            status_response(&agent, &request.id).await
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_MYSQL, "Restart", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            agent.catalog.require(&request.id)?;
            agent.service_runtime.restart(&request.id).await?;
            status_response(&agent, &request.id).await
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_MYSQL, "Delete", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            delete(agent, &request.id).await
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_MYSQL, "Upgrade", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: UpgradeRequest = parse(payload)?;
            let mut record = agent.catalog.require(&request.id)?;
            record.image = request.image;
            record.tag = request.tag;
            agent.catalog.update(record.clone())?;
            agent.service_runtime.start(&record).await?;
            let node = MysqlNode::load(agent.clone(), &request.id)?;
            Ok(info_response(&agent, &node).await)
        }
    });

    let ctx = agent.clone();
    registry.register(SERVICE_MYSQL, "SetupReplica", true, move |_ctx, payload| {
        let agent = ctx.clone();
        async move {
            let request: IdRequest = parse(payload)?;
            let node = MysqlNode::load(agent.clone(), &request.id)?;
            node.setup_replica().await?;
            Ok(json!({}))
        }
    });

    let ctx = agent.clone();
    registry.register(
        SERVICE_MYSQL,
        "SyncReplicationUser",
        true,
        move |_ctx, payload| {
            let agent = ctx.clone();
            async move {
                let request: IdRequest = parse(payload)?;
                let node = MysqlNode::load(agent.clone(), &request.id)?;
                node.sync_replication_user().await?;
                Ok(json!({}))
            }
        },
    );
}

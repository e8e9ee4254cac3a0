mod common;

use common::{sample_db_record, test_agent, test_harness};
use rds_agent::core::jobs::worker::JobEngine;
use rds_agent::rpc::{RequestEnvelope, SERVICE_INTER_AGENT, Status};
use rds_agent::server::dispatch::{AuthScope, dispatch};
use rds_agent::services::build_registry;
use serde_json::json;

fn request(method: &str, payload: serde_json::Value) -> RequestEnvelope {
    RequestEnvelope {
        id: 1,
        service: SERVICE_INTER_AGENT.to_string(),
        method: method.to_string(),
        auth_token: String::new(),
        payload,
    }
}

#[tokio::test]
async fn test_rsync_access_grants_follow_naming_convention() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = test_harness(tmp.path());
    let agent = harness.agent.clone();
    agent.catalog.insert(sample_db_record("db-1", "c1")).unwrap();

    let engine = JobEngine::new(agent.clone());
    let registry = build_registry(&agent, &engine);

    let response = dispatch(
        &agent,
        &registry,
        AuthScope::Cluster("c1".to_string()),
        "peer",
        request(
            "RequestRsyncAccess",
            json!({ "cluster_id": "c1", "node_id": "db-1" }),
        ),
    )
    .await;

    assert_eq!(response.code, Status::Ok);
    let instance_id = response.payload["instance_id"].as_str().unwrap();
    assert!(instance_id.starts_with("rsync.c1.db-1."));
    assert_eq!(response.payload["src_path"], "/data");
    assert_eq!(response.payload["username"].as_str().unwrap().len(), 32);

    let sidecars = harness.sidecar_runtime.launched.lock().clone();
    assert_eq!(sidecars, vec![instance_id.to_string()]);
}

#[tokio::test]
async fn test_rsync_access_is_denied_across_clusters() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    agent.catalog.insert(sample_db_record("db-1", "c1")).unwrap();

    let engine = JobEngine::new(agent.clone());
    let registry = build_registry(&agent, &engine);

    // db-1 belongs to c1; a caller authenticated for c2 must not touch it.
    let response = dispatch(
        &agent,
        &registry,
        AuthScope::Cluster("c2".to_string()),
        "peer",
        request(
            "RequestRsyncAccess",
            json!({ "cluster_id": "c2", "node_id": "db-1" }),
        ),
    )
    .await;
    assert_eq!(response.code, Status::PermissionDenied);
}

#[tokio::test]
async fn test_revoke_enforces_instance_prefix() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());

    let engine = JobEngine::new(agent.clone());
    let registry = build_registry(&agent, &engine);

    let response = dispatch(
        &agent,
        &registry,
        AuthScope::Cluster("c1".to_string()),
        "peer",
        request(
            "RevokeRsyncAccess",
            json!({ "cluster_id": "c1", "instance_id": "rsync.c2.db-9.deadbeef" }),
        ),
    )
    .await;
    assert_eq!(response.code, Status::PermissionDenied);

    let response = dispatch(
        &agent,
        &registry,
        AuthScope::Cluster("c1".to_string()),
        "peer",
        request(
            "RevokeRsyncAccess",
            json!({ "cluster_id": "c1", "instance_id": "rsync.c1.db-1.deadbeef" }),
        ),
    )
    .await;
    assert_eq!(response.code, Status::Ok);
}

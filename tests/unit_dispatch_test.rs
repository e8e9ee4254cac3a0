mod common;

use common::test_agent;
use rds_agent::core::errors::AgentError;
use rds_agent::core::jobs::JobStatus;
use rds_agent::rpc::{RequestEnvelope, SERVICE_INTER_AGENT, SERVICE_MYSQL, Status};
use rds_agent::server::dispatch::{AuthScope, ServiceRegistry, dispatch};
use serde_json::json;
use std::sync::Arc;

fn test_registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    registry.register(SERVICE_MYSQL, "Echo", true, |_ctx, payload| async move {
        Ok(json!({ "echo": payload }))
    });
    registry.register(SERVICE_MYSQL, "Boom", true, |_ctx, _payload| async move {
        Err::<serde_json::Value, _>(AgentError::Internal("kaput".to_string()))
    });
    registry.register(SERVICE_MYSQL, "Reject", true, |_ctx, _payload| async move {
        Err::<serde_json::Value, _>(AgentError::InvalidArgument("bad field".to_string()))
    });
    registry.register(
        SERVICE_INTER_AGENT,
        "Echo",
        false,
        |_ctx, payload| async move { Ok(json!({ "echo": payload })) },
    );
    registry
}

fn request(service: &str, method: &str, payload: serde_json::Value) -> RequestEnvelope {
    RequestEnvelope {
        id: 9,
        service: service.to_string(),
        method: method.to_string(),
        auth_token: String::new(),
        payload,
    }
}

#[tokio::test]
async fn test_unknown_method_is_unimplemented() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    let registry = test_registry();

    let response = dispatch(
        &agent,
        &registry,
        AuthScope::Direct,
        "peer",
        request(SERVICE_MYSQL, "Nope", json!({})),
    )
    .await;
    assert_eq!(response.code, Status::Unimplemented);
}

#[tokio::test]
async fn test_sync_success_carries_success_meta() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    let registry = test_registry();

    let response = dispatch(
        &agent,
        &registry,
        AuthScope::Direct,
        "peer",
        request(SERVICE_MYSQL, "Echo", json!({ "value": 1 })),
    )
    .await;
    assert_eq!(response.code, Status::Ok);
    assert_eq!(response.payload["meta"]["status"], "SUCCESS");
    assert_eq!(response.payload["echo"]["value"], 1);
}

#[tokio::test]
async fn test_async_tagged_request_becomes_a_draft_job() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    let registry = test_registry();

    let response = dispatch(
        &agent,
        &registry,
        AuthScope::Direct,
        "peer",
        request(
            SERVICE_MYSQL,
            "Echo",
            json!({ "value": 1, "meta": { "is_async": true, "ref": "deploy-7" } }),
        ),
    )
    .await;

    // The caller gets an immediate skeleton response with the job handle.
    assert_eq!(response.code, Status::Ok);
    let job_id = response.payload["meta"]["job_id"].as_u64().unwrap();
    assert_eq!(response.payload["meta"]["status"], "DRAFT");
    assert_eq!(response.payload["meta"]["ref"], "deploy-7");

    // The draft is durable and still carries the original request.
    let job = agent.jobs.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Draft);
    assert_eq!(job.service, SERVICE_MYSQL);
    assert_eq!(job.method, "Echo");
    assert_eq!(job.request_blob["value"], 1);
}

#[tokio::test]
async fn test_inter_agent_requests_never_defer() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    let registry = test_registry();

    let response = dispatch(
        &agent,
        &registry,
        AuthScope::Cluster("c1".to_string()),
        "peer",
        request(
            SERVICE_INTER_AGENT,
            "Echo",
            json!({ "meta": { "is_async": true } }),
        ),
    )
    .await;
    assert_eq!(response.code, Status::Ok);
    // Executed inline: no job was created.
    assert!(agent.jobs.unacknowledged().is_empty());
    assert!(response.payload["echo"].is_object());
}

#[tokio::test]
async fn test_operational_failure_maps_to_failure_meta() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    let registry = test_registry();

    let response = dispatch(
        &agent,
        &registry,
        AuthScope::Direct,
        "peer",
        request(SERVICE_MYSQL, "Boom", json!({})),
    )
    .await;
    // Meta-capable methods report operational failures in-band.
    assert_eq!(response.code, Status::Ok);
    assert_eq!(response.payload["meta"]["status"], "FAILURE");
    assert!(
        response.payload["meta"]["error_message"]
            .as_str()
            .unwrap()
            .contains("kaput")
    );
}

#[tokio::test]
async fn test_validation_failure_surfaces_as_rpc_status() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    let registry = test_registry();

    let response = dispatch(
        &agent,
        &registry,
        AuthScope::Direct,
        "peer",
        request(SERVICE_MYSQL, "Reject", json!({})),
    )
    .await;
    assert_eq!(response.code, Status::InvalidArgument);
}

#[tokio::test]
async fn test_non_async_meta_executes_inline() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    let registry = Arc::new(test_registry());

    let response = dispatch(
        &agent,
        &registry,
        AuthScope::Direct,
        "peer",
        request(
            SERVICE_MYSQL,
            "Echo",
            json!({ "meta": { "is_async": false } }),
        ),
    )
    .await;
    assert_eq!(response.code, Status::Ok);
    assert_eq!(response.payload["meta"]["status"], "SUCCESS");
    assert!(agent.jobs.unacknowledged().is_empty());
}

mod common;

use common::{DIRECT_SECRET, test_agent};
use rds_agent::core::errors::AgentError;
use rds_agent::rpc::{RequestEnvelope, SERVICE_INTER_AGENT, SERVICE_MYSQL};
use rds_agent::server::auth::authenticate;
use rds_agent::server::dispatch::AuthScope;
use serde_json::json;

fn request(service: &str, token: &str, payload: serde_json::Value) -> RequestEnvelope {
    RequestEnvelope {
        id: 1,
        service: service.to_string(),
        method: "Whatever".to_string(),
        auth_token: token.to_string(),
        payload,
    }
}

#[tokio::test]
async fn test_direct_token_grants_full_scope() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());

    let mut req = request(SERVICE_MYSQL, &format!("direct:{DIRECT_SECRET}:"), json!({}));
    assert_eq!(authenticate(&agent, &mut req).unwrap(), AuthScope::Direct);
}

#[tokio::test]
async fn test_wrong_direct_secret_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());

    let mut req = request(SERVICE_MYSQL, "direct:not-the-secret:", json!({}));
    assert!(matches!(
        authenticate(&agent, &mut req),
        Err(AgentError::Unauthenticated(_))
    ));
}

#[tokio::test]
async fn test_malformed_tokens_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());

    for token in ["", "direct", "direct:", "nonsense:tok:c1", "::c1"] {
        let mut req = request(SERVICE_MYSQL, token, json!({}));
        assert!(
            matches!(
                authenticate(&agent, &mut req),
                Err(AgentError::Unauthenticated(_))
            ),
            "token {token:?} should be rejected"
        );
    }
}

#[tokio::test]
async fn test_cluster_token_is_confined_to_inter_agent_service() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    agent.shared_tokens.set("c1", "cluster-token");

    // MySQL/Delete with a cluster credential must never reach a handler.
    let mut req = request(SERVICE_MYSQL, "cluster:cluster-token:c1", json!({}));
    assert!(matches!(
        authenticate(&agent, &mut req),
        Err(AgentError::Unauthenticated(_))
    ));

    let mut req = request(SERVICE_INTER_AGENT, "cluster:cluster-token:c1", json!({}));
    assert_eq!(
        authenticate(&agent, &mut req).unwrap(),
        AuthScope::Cluster("c1".to_string())
    );
}

#[tokio::test]
async fn test_cluster_token_pins_body_cluster_id() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    agent.shared_tokens.set("c1", "cluster-token");

    // A forged body-level cluster_id is overwritten before dispatch.
    let mut req = request(
        SERVICE_INTER_AGENT,
        "cluster:cluster-token:c1",
        json!({ "cluster_id": "other", "node_id": "n1" }),
    );
    authenticate(&agent, &mut req).unwrap();
    assert_eq!(req.payload["cluster_id"], "c1");
    assert_eq!(req.payload["node_id"], "n1");
}

#[tokio::test]
async fn test_wrong_shared_token_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    agent.shared_tokens.set("c1", "cluster-token");

    let mut req = request(SERVICE_INTER_AGENT, "cluster:stolen:c1", json!({}));
    assert!(matches!(
        authenticate(&agent, &mut req),
        Err(AgentError::Unauthenticated(_))
    ));

    // Unknown cluster ids fail the same way.
    let mut req = request(SERVICE_INTER_AGENT, "cluster:cluster-token:ghost", json!({}));
    assert!(matches!(
        authenticate(&agent, &mut req),
        Err(AgentError::Unauthenticated(_))
    ));
}

#[tokio::test]
async fn test_direct_inter_agent_calls_require_cluster_id() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    let token = format!("direct:{DIRECT_SECRET}:");

    let mut req = request(SERVICE_INTER_AGENT, &token, json!({}));
    assert!(matches!(
        authenticate(&agent, &mut req),
        Err(AgentError::Unauthenticated(_))
    ));

    let mut req = request(SERVICE_INTER_AGENT, &token, json!({ "cluster_id": "c1" }));
    assert_eq!(authenticate(&agent, &mut req).unwrap(), AuthScope::Direct);
}

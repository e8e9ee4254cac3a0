mod common;

use common::{sample_db_record, test_agent};
use rds_agent::core::monitor::dead_node::DeadNodeDetector;
use rds_agent::core::monitor::election::Elector;
use rds_agent::core::monitor::health::{HealthMonitor, flip_check_due};
use std::time::Instant;
use rds_agent::core::monitor::state::StateMonitor;
use rds_agent::core::pubsub::{ETCD_MONITOR_COMMANDS, MYSQL_MONITOR_COMMANDS};
use std::time::Duration;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_health_monitor_tracks_commands_at_most_once() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    agent.catalog.insert(sample_db_record("db-1", "c1")).unwrap();

    let monitor = HealthMonitor::new(agent.clone());
    let run = tokio::spawn(monitor.clone().run(agent.shutdown_rx()));
    settle().await;

    agent
        .broker
        .publish_command(MYSQL_MONITOR_COMMANDS, "add", "db-1");
    // A duplicate add must not create a second probe loop.
    agent
        .broker
        .publish_command(MYSQL_MONITOR_COMMANDS, "add", "db-1");
    settle().await;
    assert_eq!(monitor.probed_ids().await, vec!["db-1"]);

    // Unknown ids are ignored outright.
    agent
        .broker
        .publish_command(MYSQL_MONITOR_COMMANDS, "add", "ghost");
    settle().await;
    assert_eq!(monitor.probed_ids().await, vec!["db-1"]);

    agent
        .broker
        .publish_command(MYSQL_MONITOR_COMMANDS, "remove", "db-1");
    settle().await;
    assert!(monitor.probed_ids().await.is_empty());

    agent.trigger_shutdown();
    let _ = run.await;
}

#[test]
fn test_online_flip_attempts_are_rate_limited() {
    let window = Duration::from_secs(600);
    // First success after startup or a failed probe: check immediately.
    assert!(flip_check_due(None, window));
    // Checked moments ago: suppressed for the rest of the window, so a
    // flapping node cannot hammer the config key.
    assert!(!flip_check_due(Some(Instant::now()), window));
    // Stamp older than the window: due again.
    assert!(flip_check_due(
        Instant::now().checked_sub(window + Duration::from_secs(1)),
        window
    ));
}

#[tokio::test]
async fn test_state_monitor_refuses_to_drop_in_use_clusters() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = test_agent(tmp.path());
    agent.catalog.insert(sample_db_record("db-1", "c1")).unwrap();

    let detector = DeadNodeDetector::new(agent.config.monitor.dead_node_timeout);
    let elector = Elector::new(agent.clone());
    let monitor = StateMonitor::new(agent.clone(), detector, elector);
    let run = tokio::spawn(monitor.clone().run(agent.shutdown_rx()));
    settle().await;

    agent
        .broker
        .publish_command(ETCD_MONITOR_COMMANDS, "add", "c1");
    settle().await;
    assert_eq!(monitor.watched_clusters().await, vec!["c1"]);

    // The cluster still has a local record, so removal is refused.
    agent
        .broker
        .publish_command(ETCD_MONITOR_COMMANDS, "remove", "c1");
    settle().await;
    assert_eq!(monitor.watched_clusters().await, vec!["c1"]);

    // Once the last record is gone, the removal goes through.
    agent.catalog.remove("db-1").unwrap();
    agent
        .broker
        .publish_command(ETCD_MONITOR_COMMANDS, "remove", "c1");
    settle().await;
    assert!(monitor.watched_clusters().await.is_empty());

    agent.trigger_shutdown();
    let _ = run.await;
}

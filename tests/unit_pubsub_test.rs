use rds_agent::core::pubsub::{Broker, MonitorCommand};

#[tokio::test]
async fn test_publish_reaches_all_subscribers() {
    let broker = Broker::new();
    let mut first = broker.subscribe("events");
    let mut second = broker.subscribe("events");

    assert_eq!(broker.publish("events", "hello"), 2);
    assert_eq!(&first.recv().await.unwrap()[..], b"hello");
    assert_eq!(&second.recv().await.unwrap()[..], b"hello");
}

#[tokio::test]
async fn test_publish_without_subscribers_is_dropped() {
    let broker = Broker::new();
    assert_eq!(broker.publish("nobody-home", "hello"), 0);
}

#[tokio::test]
async fn test_channels_are_isolated() {
    let broker = Broker::new();
    let mut listener = broker.subscribe("a");
    broker.publish("b", "for-b");
    broker.publish("a", "for-a");
    assert_eq!(&listener.recv().await.unwrap()[..], b"for-a");
}

#[tokio::test]
async fn test_command_helper_formats_verb_and_id() {
    let broker = Broker::new();
    let mut listener = broker.subscribe("cmd");
    broker.publish_command("cmd", "add", "db-1");
    let raw = listener.recv().await.unwrap();
    assert_eq!(
        MonitorCommand::parse(&raw),
        Some(MonitorCommand::Add("db-1".to_string()))
    );
}

#[test]
fn test_command_parsing() {
    assert_eq!(
        MonitorCommand::parse(b"add db-1"),
        Some(MonitorCommand::Add("db-1".to_string()))
    );
    assert_eq!(
        MonitorCommand::parse(b"remove db-1"),
        Some(MonitorCommand::Remove("db-1".to_string()))
    );
    assert_eq!(
        MonitorCommand::parse(b"reload db-1"),
        Some(MonitorCommand::Reload("db-1".to_string()))
    );
    // Unknown verbs, missing ids, and trailing junk are all skipped.
    assert_eq!(MonitorCommand::parse(b"destroy db-1"), None);
    assert_eq!(MonitorCommand::parse(b"add"), None);
    assert_eq!(MonitorCommand::parse(b"add db-1 extra"), None);
    assert_eq!(MonitorCommand::parse(&[0xff, 0xfe]), None);
}

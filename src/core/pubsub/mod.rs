// src/core/pubsub/mod.rs

//! The in-process publish-subscribe broker.
//!
//! Background loops coordinate through named channels on this broker: job
//! updates fan out to `Job/Listen` streams, and the monitor loops receive
//! their `add`/`remove` membership commands here. Channels are created
//! lazily on first use and never torn down; the set of channel names is a
//! small closed vocabulary.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;

/// Serialized job records, one message per durable mutation.
pub const JOB_UPDATE_STREAM: &str = "job_update_stream";
/// ASCII `add <db_id>` / `remove <db_id>` / `reload <db_id>` commands.
pub const MYSQL_MONITOR_COMMANDS: &str = "mysql_monitor_commands";
/// ASCII `add <cluster_id>` / `remove <cluster_id>` commands.
pub const ETCD_MONITOR_COMMANDS: &str = "etcd_monitor_commands";

/// The capacity of each individual broadcast channel.
const CHANNEL_CAPACITY: usize = 256;

/// `Broker` is the central hub for intra-process messaging.
#[derive(Debug, Default)]
pub struct Broker {
    channels: DashMap<String, Arc<Sender<Bytes>>>,
}

impl Broker {
    pub fn new() -> Self {
        Default::default()
    }

    fn sender(&self, channel: &str) -> Arc<Sender<Bytes>> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(broadcast::channel(CHANNEL_CAPACITY).0))
            .value()
            .clone()
    }

    /// Subscribes to a channel, creating it if necessary.
    pub fn subscribe(&self, channel: &str) -> Receiver<Bytes> {
        self.sender(channel).subscribe()
    }

    /// Publishes a message, returning the number of live subscribers that
    /// received it. A message published to a channel nobody listens on is
    /// dropped; periodic reconciliation makes that harmless.
    pub fn publish(&self, channel: &str, message: impl Into<Bytes>) -> usize {
        let message = message.into();
        let sender = self.sender(channel);
        match sender.send(message) {
            Ok(n) => n,
            Err(_) => {
                debug!("No subscribers on channel '{channel}', message dropped");
                0
            }
        }
    }

    /// Publishes an ASCII monitor command like `add db-1`.
    pub fn publish_command(&self, channel: &str, verb: &str, id: &str) -> usize {
        self.publish(channel, format!("{verb} {id}"))
    }
}

/// A parsed monitor command from one of the command channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCommand {
    Add(String),
    Remove(String),
    Reload(String),
}

impl MonitorCommand {
    /// Parses `"<verb> <id>"`. Unknown verbs and malformed payloads yield
    /// `None` and are skipped by the listeners.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let mut parts = text.split_whitespace();
        let verb = parts.next()?;
        let id = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        match verb {
            "add" => Some(MonitorCommand::Add(id.to_string())),
            "remove" => Some(MonitorCommand::Remove(id.to_string())),
            "reload" => Some(MonitorCommand::Reload(id.to_string())),
            _ => None,
        }
    }
}

//! Event transports: Redis pub/sub across processes, or an in-process
//! broadcast for tests and single-node development.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use tokio::sync::broadcast;

use super::channel::Channel;
use super::error::EventBusError;
use crate::util::with_timeout;

/// Capacity of the in-process broadcast ring.
const LOCAL_BUS_CAPACITY: usize = 1024;

/// One serialized envelope addressed to one channel.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: Channel,
    pub payload: Arc<str>,
}

/// Publishes serialized envelopes to a single channel.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn publish(&self, channel: &Channel, payload: &str) -> Result<(), EventBusError>;
}

/// Redis channel name for a bus channel: `{prefix}:bus:{channel}`.
pub fn bus_channel(prefix: &str, channel: &Channel) -> String {
    format!("{prefix}:bus:{channel}")
}

/// Pattern matching every bus channel under `prefix`.
pub fn bus_pattern(prefix: &str) -> String {
    format!("{prefix}:bus:*")
}

/// Recover the bus channel from a Redis channel name, rejecting anything
/// outside the grammar.
pub fn parse_bus_channel(prefix: &str, raw: &str) -> Option<Channel> {
    let rest = raw.strip_prefix(prefix)?.strip_prefix(":bus:")?;
    Channel::parse(rest).ok()
}

/// Redis pub/sub transport shared by every process.
#[derive(Clone)]
pub struct RedisTransport {
    redis: Client,
    prefix: String,
    timeout: Duration,
}

impl RedisTransport {
    pub fn new(redis: Client, prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            timeout,
        }
    }
}

#[async_trait]
impl EventTransport for RedisTransport {
    async fn publish(&self, channel: &Channel, payload: &str) -> Result<(), EventBusError> {
        let name = bus_channel(&self.prefix, channel);
        let publish = async {
            let _receivers: i64 = self.redis.publish(name, payload).await?;
            Ok(())
        };
        with_timeout(self.timeout, publish, || EventBusError::Timeout).await
    }
}

/// In-process transport over a `tokio` broadcast channel.
#[derive(Clone)]
pub struct LocalTransport {
    tx: broadcast::Sender<BusMessage>,
}

impl LocalTransport {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventTransport for LocalTransport {
    async fn publish(&self, channel: &Channel, payload: &str) -> Result<(), EventBusError> {
        // No live receiver is not an error, same as PUBLISH returning 0.
        let _ = self.tx.send(BusMessage {
            channel: *channel,
            payload: Arc::from(payload),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn bus_channel_names_round_trip() {
        let channel = Channel::UserTasks(Uuid::new_v4());
        let name = bus_channel("sb", &channel);
        assert!(name.starts_with("sb:bus:user:"));
        assert_eq!(parse_bus_channel("sb", &name), Some(channel));
    }

    #[test]
    fn foreign_channels_are_ignored() {
        assert_eq!(parse_bus_channel("sb", "other:bus:tenant:x:events"), None);
        assert_eq!(parse_bus_channel("sb", "sb:bus:tenant:*:events"), None);
        assert_eq!(parse_bus_channel("sb", "sb:lease:abc"), None);
    }

    #[tokio::test]
    async fn local_transport_fans_out_to_subscribers() {
        let transport = LocalTransport::new();
        let mut rx = transport.subscribe();
        let channel = Channel::TenantEvents(Uuid::new_v4());

        transport.publish(&channel, r#"{"a":1}"#).await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.channel, channel);
        assert_eq!(&*message.payload, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn local_transport_without_subscribers_succeeds() {
        let transport = LocalTransport::new();
        let channel = Channel::TenantEvents(Uuid::new_v4());
        assert!(transport.publish(&channel, "{}").await.is_ok());
    }
}

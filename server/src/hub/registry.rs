//! Process-local connection registry and channel index.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::access::AccessDirectory;
use super::connection::{CloseReason, Connection, ConnectionState, SendOutcome};
use super::error::HubError;
use super::protocol::event_frame;
use crate::config::HubConfig;
use crate::events::Channel;
use crate::observability::metrics;

/// Authorizes subscriptions and fans events out to live connections.
#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    connections: DashMap<Uuid, Arc<Connection>>,
    channels: DashMap<Channel, HashSet<Uuid>>,
    directory: Arc<dyn AccessDirectory>,
    config: HubConfig,
}

impl SubscriptionHub {
    pub fn new(directory: Arc<dyn AccessDirectory>, config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: DashMap::new(),
                channels: DashMap::new(),
                directory,
                config,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Register an authenticated connection and return its outbound queue.
    pub fn register(&self, tenant_id: Uuid, user_id: Uuid) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (connection, rx) = Connection::new(
            tenant_id,
            user_id,
            self.inner.config.queue_capacity,
            self.inner.config.max_dropped,
        );
        connection.transition(ConnectionState::Connecting, ConnectionState::Authenticated);

        let connection = Arc::new(connection);
        self.inner
            .connections
            .insert(connection.id, Arc::clone(&connection));
        metrics::record_ws_connect();
        info!(
            connection_id = %connection.id,
            tenant_id = %tenant_id,
            user_id = %user_id,
            "WebSocket connected"
        );
        (connection, rx)
    }

    /// Start accepting control frames on an authenticated connection.
    pub fn activate(&self, connection: &Connection) -> bool {
        connection.transition(ConnectionState::Authenticated, ConnectionState::Active)
    }

    /// Subscribe after checking the grammar and the caller's namespace.
    #[tracing::instrument(skip(self, connection), fields(connection_id = %connection.id))]
    pub async fn subscribe(&self, connection: &Connection, raw: &str) -> Result<Channel, HubError> {
        let channel = Channel::parse(raw)?;
        self.authorize(connection, &channel).await?;

        let mut subscriptions = connection
            .subscriptions
            .lock()
            .map_err(|_| HubError::Closed)?;
        if connection.is_closing() {
            return Err(HubError::Closed);
        }
        subscriptions.insert(channel);
        self.inner
            .channels
            .entry(channel)
            .or_default()
            .insert(connection.id);

        debug!(channel = %channel, "Subscribed");
        Ok(channel)
    }

    /// Remove a subscription. Unknown channels are a no-op.
    pub fn unsubscribe(&self, connection: &Connection, raw: &str) -> Result<Channel, HubError> {
        let channel = Channel::parse(raw)?;
        if let Ok(mut subscriptions) = connection.subscriptions.lock() {
            subscriptions.remove(&channel);
        }
        self.remove_from_index(&channel, connection.id);
        Ok(channel)
    }

    async fn authorize(&self, connection: &Connection, channel: &Channel) -> Result<(), HubError> {
        let allowed = match *channel {
            Channel::TenantEvents(tenant_id) => tenant_id == connection.tenant_id,
            Channel::UserTasks(user_id) => user_id == connection.user_id,
            Channel::LeadTimeline(lead_id) => {
                self.inner
                    .directory
                    .can_access(connection.tenant_id, connection.user_id, lead_id)
                    .await?
            }
        };

        if allowed {
            Ok(())
        } else {
            warn!(
                security_event = true,
                tenant_id = %connection.tenant_id,
                user_id = %connection.user_id,
                channel = %channel,
                "Subscription outside caller namespace rejected"
            );
            Err(HubError::Forbidden)
        }
    }

    /// Queue an envelope for every connection subscribed to `channel`.
    ///
    /// Returns how many connections accepted it. A connection whose queue
    /// keeps overflowing is closed as a slow consumer.
    pub fn deliver(&self, channel: &Channel, envelope_json: &str) -> usize {
        let subscribers: Vec<Uuid> = match self.inner.channels.get(channel) {
            Some(ids) => ids.iter().copied().collect(),
            None => return 0,
        };

        let frame = event_frame(channel, envelope_json);
        let mut delivered = 0;
        for id in subscribers {
            let Some(connection) = self.connection(id) else {
                continue;
            };
            match connection.try_send(frame.clone()) {
                SendOutcome::Queued => delivered += 1,
                SendOutcome::Dropped | SendOutcome::Closed => {}
                SendOutcome::Overflow => {
                    warn!(connection_id = %id, "Closing slow consumer");
                    self.close(&connection, CloseReason::SlowConsumer);
                }
            }
        }
        delivered
    }

    /// Close a connection exactly once: deregister, drop its subscriptions,
    /// and update metrics. Later calls are no-ops returning `false`.
    pub fn close(&self, connection: &Connection, reason: CloseReason) -> bool {
        if !connection.begin_close(reason) {
            return false;
        }

        self.inner.connections.remove(&connection.id);
        let channels: Vec<Channel> = connection
            .subscriptions
            .lock()
            .map(|mut subs| subs.drain().collect())
            .unwrap_or_default();
        for channel in &channels {
            self.remove_from_index(channel, connection.id);
        }

        connection.finish_close();
        metrics::record_ws_disconnect(reason.as_str());
        info!(
            connection_id = %connection.id,
            reason = reason.as_str(),
            "WebSocket disconnected"
        );
        true
    }

    /// Close every connection, used on shutdown.
    pub fn close_all(&self, reason: CloseReason) {
        let connections: Vec<Arc<Connection>> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for connection in connections {
            self.close(&connection, reason);
        }
    }

    pub fn connection(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.inner.channels.get(channel).map_or(0, |ids| ids.len())
    }

    fn remove_from_index(&self, channel: &Channel, connection_id: Uuid) {
        if let Some(mut ids) = self.inner.channels.get_mut(channel) {
            ids.remove(&connection_id);
        }
        self.inner.channels.remove_if(channel, |_, ids| ids.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::hub::{DenyAll, StaticAccessDirectory};

    fn config() -> HubConfig {
        HubConfig {
            idle_timeout: Duration::from_secs(30),
            queue_capacity: 4,
            control_limit: 20,
            control_window: Duration::from_secs(10),
            max_dropped: 2,
        }
    }

    fn hub() -> SubscriptionHub {
        SubscriptionHub::new(Arc::new(DenyAll), config())
    }

    #[tokio::test]
    async fn own_namespace_subscriptions_are_allowed() {
        let hub = hub();
        let (tenant, user) = (Uuid::new_v4(), Uuid::new_v4());
        let (conn, _rx) = hub.register(tenant, user);

        let tenant_channel = hub.subscribe(&conn, &format!("tenant:{tenant}:events")).await.unwrap();
        let user_channel = hub.subscribe(&conn, &format!("user:{user}:tasks")).await.unwrap();

        assert!(conn.is_subscribed(&tenant_channel));
        assert_eq!(hub.subscriber_count(&user_channel), 1);
    }

    #[tokio::test]
    async fn cross_tenant_subscription_is_rejected_and_never_delivered() {
        let hub = hub();
        let (conn, mut rx) = hub.register(Uuid::new_v4(), Uuid::new_v4());
        let other = Channel::TenantEvents(Uuid::new_v4());

        assert_eq!(
            hub.subscribe(&conn, &other.to_string()).await,
            Err(HubError::Forbidden)
        );
        assert_eq!(
            hub.subscribe(&conn, &format!("user:{}:tasks", Uuid::new_v4())).await,
            Err(HubError::Forbidden)
        );
        assert_eq!(hub.deliver(&other, "{}"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_channel_is_rejected() {
        let hub = hub();
        let (conn, _rx) = hub.register(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(
            hub.subscribe(&conn, "tenant:*:events").await,
            Err(HubError::InvalidChannel)
        );
    }

    #[tokio::test]
    async fn lead_channels_defer_to_directory() {
        let access = Arc::new(StaticAccessDirectory::new());
        let hub = SubscriptionHub::new(access.clone(), config());
        let tenant = Uuid::new_v4();
        let (own_lead, foreign_lead) = (Uuid::new_v4(), Uuid::new_v4());
        access.grant_lead(own_lead, tenant);
        access.grant_lead(foreign_lead, Uuid::new_v4());

        let (conn, _rx) = hub.register(tenant, Uuid::new_v4());
        assert!(hub.subscribe(&conn, &format!("lead:{own_lead}:timeline")).await.is_ok());
        assert_eq!(
            hub.subscribe(&conn, &format!("lead:{foreign_lead}:timeline")).await,
            Err(HubError::Forbidden)
        );
    }

    #[tokio::test]
    async fn deliver_reaches_only_subscribers() {
        let hub = hub();
        let tenant = Uuid::new_v4();
        let (a, mut rx_a) = hub.register(tenant, Uuid::new_v4());
        let (_b, mut rx_b) = hub.register(tenant, Uuid::new_v4());
        let channel = hub.subscribe(&a, &format!("tenant:{tenant}:events")).await.unwrap();

        assert_eq!(hub.deliver(&channel, r#"{"n":1}"#), 1);
        let frame = rx_a.try_recv().unwrap();
        assert!(frame.contains(r#""event":{"n":1}"#));
        assert!(rx_b.try_recv().is_err());

        hub.unsubscribe(&a, &channel.to_string()).unwrap();
        assert_eq!(hub.deliver(&channel, "{}"), 0);
        assert_eq!(hub.subscriber_count(&channel), 0);
    }

    #[tokio::test]
    async fn close_happens_once_and_deregisters() {
        let hub = hub();
        let tenant = Uuid::new_v4();
        let (conn, _rx) = hub.register(tenant, Uuid::new_v4());
        let channel = hub.subscribe(&conn, &format!("tenant:{tenant}:events")).await.unwrap();
        assert_eq!(hub.connection_count(), 1);

        assert!(hub.close(&conn, CloseReason::ClientClosed));
        assert!(!hub.close(&conn, CloseReason::TransportError));
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.subscriber_count(&channel), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_reason(), CloseReason::ClientClosed);

        // Subscribing after close fails.
        assert_eq!(
            hub.subscribe(&conn, &channel.to_string()).await,
            Err(HubError::Closed)
        );
    }

    #[tokio::test]
    async fn slow_consumer_is_disconnected() {
        let hub = hub();
        let tenant = Uuid::new_v4();
        let (conn, _rx) = hub.register(tenant, Uuid::new_v4());
        let channel = hub.subscribe(&conn, &format!("tenant:{tenant}:events")).await.unwrap();

        // Capacity 4, then two consecutive drops trip the limit.
        for _ in 0..4 {
            assert_eq!(hub.deliver(&channel, "{}"), 1);
        }
        assert_eq!(hub.deliver(&channel, "{}"), 0);
        assert!(!conn.is_closing());
        assert_eq!(hub.deliver(&channel, "{}"), 0);

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_reason(), CloseReason::SlowConsumer);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let hub = hub();
        let _a = hub.register(Uuid::new_v4(), Uuid::new_v4());
        let _b = hub.register(Uuid::new_v4(), Uuid::new_v4());
        hub.close_all(CloseReason::Shutdown);
        assert_eq!(hub.connection_count(), 0);
    }
}

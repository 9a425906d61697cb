//! Event bus: envelope construction, size bounding, and per-channel publish.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use super::envelope::{DomainEvent, EventEnvelope};
use super::transport::EventTransport;
use crate::observability::metrics;

/// Best-effort fanout of domain events to their derived channels.
#[derive(Clone)]
pub struct EventBus {
    transport: Arc<dyn EventTransport>,
    size_cap: usize,
}

impl EventBus {
    pub fn new(transport: Arc<dyn EventTransport>, size_cap: usize) -> Self {
        Self {
            transport,
            size_cap,
        }
    }

    pub const fn size_cap(&self) -> usize {
        self.size_cap
    }

    /// Publish one event to every channel it derives.
    ///
    /// Channels are published independently; a failing channel is logged and
    /// counted without affecting the others. Returns `true` when at least one
    /// channel publish succeeded.
    #[tracing::instrument(
        skip(self, event),
        fields(event_name = %event.event_name, tenant_id = %event.tenant_id, trace_id = ?event.trace_id)
    )]
    pub async fn publish(&self, event: DomainEvent) -> bool {
        let channels = event.channels();
        let mut envelope = EventEnvelope::new(event, self.size_cap);

        let (payload, truncated) = match envelope.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "Dropping event that cannot be encoded");
                for channel in &channels {
                    metrics::record_event_published(channel.kind(), false);
                }
                return false;
            }
        };
        if truncated {
            debug!(size_cap = self.size_cap, "Event payload replaced by truncation pointer");
            metrics::record_event_truncated();
        }

        let results = join_all(
            channels
                .iter()
                .map(|channel| self.transport.publish(channel, &payload)),
        )
        .await;

        let mut delivered = false;
        for (channel, result) in channels.iter().zip(results) {
            match result {
                Ok(()) => {
                    metrics::record_event_published(channel.kind(), true);
                    delivered = true;
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Failed to publish event");
                    metrics::record_event_published(channel.kind(), false);
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::events::{Channel, EventBusError, DEFAULT_SIZE_CAP};

    /// Records publishes and fails every channel of the configured kind.
    #[derive(Default)]
    struct RecordingTransport {
        fail_kind: Option<&'static str>,
        sent: Mutex<Vec<(Channel, String)>>,
    }

    #[async_trait]
    impl EventTransport for RecordingTransport {
        async fn publish(&self, channel: &Channel, payload: &str) -> Result<(), EventBusError> {
            if self.fail_kind == Some(channel.kind()) {
                return Err(EventBusError::Transport("connection reset".into()));
            }
            self.sent.lock().unwrap().push((*channel, payload.to_owned()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn publishes_to_every_derived_channel() {
        let transport = Arc::new(RecordingTransport::default());
        let bus = EventBus::new(transport.clone(), DEFAULT_SIZE_CAP);
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();

        let event = DomainEvent::new("task.assigned", tenant, json!({"task_id": "t1"})).with_user(user);
        assert!(bus.publish(event).await);

        let sent = transport.sent.lock().unwrap();
        let channels: Vec<_> = sent.iter().map(|(c, _)| *c).collect();
        assert_eq!(channels, vec![Channel::TenantEvents(tenant), Channel::UserTasks(user)]);
        assert_eq!(sent[0].1, sent[1].1);
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_others() {
        let transport = Arc::new(RecordingTransport {
            fail_kind: Some("user"),
            ..Default::default()
        });
        let bus = EventBus::new(transport.clone(), DEFAULT_SIZE_CAP);
        let lead = Uuid::new_v4();
        let event = DomainEvent::new("call.completed", Uuid::new_v4(), json!({}))
            .with_user(Uuid::new_v4())
            .with_lead(lead);

        assert!(bus.publish(event).await);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().any(|(c, _)| *c == Channel::LeadTimeline(lead)));
    }

    #[tokio::test]
    async fn all_channels_failing_returns_false() {
        let transport = Arc::new(RecordingTransport {
            fail_kind: Some("tenant"),
            ..Default::default()
        });
        let bus = EventBus::new(transport, DEFAULT_SIZE_CAP);
        assert!(!bus.publish(DomainEvent::new("e", Uuid::new_v4(), json!({}))).await);
    }

    #[tokio::test]
    async fn oversized_event_is_delivered_within_cap() {
        let transport = Arc::new(RecordingTransport::default());
        let bus = EventBus::new(transport.clone(), DEFAULT_SIZE_CAP);
        let event = DomainEvent::new(
            "transcript.ready",
            Uuid::new_v4(),
            json!({"id": "rec-1", "text": "a".repeat(100_000)}),
        );

        assert!(bus.publish(event).await);
        let sent = transport.sent.lock().unwrap();
        let (_, payload) = &sent[0];
        assert!(payload.len() <= DEFAULT_SIZE_CAP);
        let envelope: EventEnvelope = serde_json::from_str(payload).unwrap();
        assert_eq!(envelope.data["id"], "rec-1");
        assert_eq!(envelope.data["_truncated"], true);
    }
}

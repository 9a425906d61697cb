//! Webhook Types

use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::events::{DomainEvent, Severity};

/// Body fields that name the provider's event type, in lookup order.
const EVENT_TYPE_FIELDS: [&str; 3] = ["event", "event_type", "type"];

/// An authenticated, freshly claimed delivery handed to a [`WebhookHandler`](super::WebhookHandler).
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub tenant_id: Uuid,
    pub provider: String,
    pub external_id: String,
    /// Deliveries seen for this external id, including this one.
    pub attempts: i32,
    pub trace_id: String,
    /// Parsed JSON body, or `Null` when the body is not JSON.
    pub payload: Value,
}

impl WebhookDelivery {
    /// Provider event type from the body, `received` when absent.
    pub fn event_type(&self) -> &str {
        EVENT_TYPE_FIELDS
            .iter()
            .find_map(|field| self.payload.get(field).and_then(Value::as_str))
            .filter(|t| is_event_token(t))
            .unwrap_or("received")
    }

    /// Domain event announcing this delivery.
    ///
    /// Routed to the user and lead channels when the body names them; the
    /// pipeline drops targets outside the tenant before publishing.
    pub fn domain_event(&self) -> DomainEvent {
        let mut data = json!({
            "provider": self.provider,
            "external_id": self.external_id,
            "attempts": self.attempts,
        });
        if let (Some(object), Some(payload)) = (data.as_object_mut(), self.payload.as_object()) {
            for (key, value) in payload {
                object.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        let mut event = DomainEvent::new(
            format!("{}.{}", self.provider, self.event_type()),
            self.tenant_id,
            data,
        )
        .with_dedup_key(format!("{}:{}", self.provider, self.external_id))
        .with_severity(Severity::Info)
        .with_trace_id(self.trace_id.clone());

        if let Some(user_id) = self.uuid_field("user_id") {
            event = event.with_user(user_id);
        }
        if let Some(lead_id) = self.uuid_field("lead_id") {
            event = event.with_lead(lead_id);
        }
        event
    }

    fn uuid_field(&self, field: &str) -> Option<Uuid> {
        self.payload
            .get(field)
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::try_parse(raw).ok())
    }
}

/// Keep event names to a safe token alphabet.
fn is_event_token(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= 64
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Successful ingestion result, serialized as `{"status": ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Processed,
    DuplicateIgnored,
}

impl IngestStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::DuplicateIgnored => "duplicate_ignored",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Channel;

    fn delivery(payload: Value) -> WebhookDelivery {
        WebhookDelivery {
            tenant_id: Uuid::new_v4(),
            provider: "callflow".into(),
            external_id: "abc".into(),
            attempts: 1,
            trace_id: "trace-1".into(),
            payload,
        }
    }

    #[test]
    fn event_name_uses_body_type() {
        assert_eq!(
            delivery(json!({"event": "call.completed"})).domain_event().event_name,
            "callflow.call.completed"
        );
        assert_eq!(delivery(json!({})).domain_event().event_name, "callflow.received");
        assert_eq!(
            delivery(json!({"type": "bad name!"})).domain_event().event_name,
            "callflow.received"
        );
    }

    #[test]
    fn routes_to_user_and_lead_when_present() {
        let (user, lead) = (Uuid::new_v4(), Uuid::new_v4());
        let d = delivery(json!({"user_id": user.to_string(), "lead_id": lead.to_string()}));
        let event = d.domain_event();
        assert_eq!(
            event.channels(),
            vec![
                Channel::TenantEvents(d.tenant_id),
                Channel::UserTasks(user),
                Channel::LeadTimeline(lead),
            ]
        );
        assert_eq!(event.dedup_key.as_deref(), Some("callflow:abc"));
        assert_eq!(event.trace_id.as_deref(), Some("trace-1"));
    }

    #[test]
    fn payload_cannot_override_delivery_identity() {
        let event = delivery(json!({"external_id": "spoofed", "call_id": "c9"})).domain_event();
        assert_eq!(event.data["external_id"], "abc");
        assert_eq!(event.data["call_id"], "c9");
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(IngestStatus::DuplicateIgnored).unwrap(),
            json!("duplicate_ignored")
        );
    }
}

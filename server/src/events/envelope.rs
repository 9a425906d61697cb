//! Event envelope and size bounding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::channel::Channel;
use super::error::EventBusError;

/// Current envelope schema version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Largest serialized envelope delivered verbatim.
pub const DEFAULT_SIZE_CAP: usize = 32 * 1024;

/// Payload fields kept in the truncation pointer so consumers can fetch the
/// full record through a separate read path.
pub const RETAINED_FIELDS: [&str; 9] = [
    "id",
    "event_id",
    "external_id",
    "call_id",
    "lead_id",
    "task_id",
    "appointment_id",
    "status",
    "provider",
];

/// Retained string values longer than this are dropped from the pointer.
const MAX_RETAINED_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

/// A domain event as handed to [`EventBus::publish`](super::EventBus::publish).
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub event_name: String,
    pub data: Value,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub lead_id: Option<Uuid>,
    pub dedup_key: Option<String>,
    pub severity: Severity,
    pub trace_id: Option<String>,
}

impl DomainEvent {
    pub fn new(event_name: impl Into<String>, tenant_id: Uuid, data: Value) -> Self {
        Self {
            event_name: event_name.into(),
            data,
            tenant_id,
            user_id: None,
            lead_id: None,
            dedup_key: None,
            severity: Severity::Info,
            trace_id: None,
        }
    }

    #[must_use]
    pub const fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub const fn with_lead(mut self, lead_id: Uuid) -> Self {
        self.lead_id = Some(lead_id);
        self
    }

    #[must_use]
    pub fn with_dedup_key(mut self, dedup_key: impl Into<String>) -> Self {
        self.dedup_key = Some(dedup_key.into());
        self
    }

    #[must_use]
    pub const fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Tenant channel always; user and lead channels when their ids are present.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = vec![Channel::TenantEvents(self.tenant_id)];
        if let Some(user_id) = self.user_id {
            channels.push(Channel::UserTasks(user_id));
        }
        if let Some(lead_id) = self.lead_id {
            channels.push(Channel::LeadTimeline(lead_id));
        }
        channels
    }
}

/// Wire format of a published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub version: u8,
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub trace_id: String,
    pub tenant_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    pub data: Value,
    pub size_cap: usize,
}

impl EventEnvelope {
    /// Wrap a domain event, minting a trace id when the event carries none.
    pub fn new(event: DomainEvent, size_cap: usize) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            event_name: event.event_name,
            timestamp: Utc::now(),
            severity: event.severity,
            trace_id: event
                .trace_id
                .unwrap_or_else(|| Uuid::now_v7().simple().to_string()),
            tenant_id: event.tenant_id,
            user_id: event.user_id,
            lead_id: event.lead_id,
            dedup_key: event.dedup_key,
            data: event.data,
            size_cap,
        }
    }

    /// Whether `data` has been replaced by a truncation pointer.
    pub fn is_truncated(&self) -> bool {
        self.data.get("_truncated").and_then(Value::as_bool) == Some(true)
    }

    /// Serialize, swapping `data` for a pointer when the envelope exceeds the cap.
    ///
    /// Returns the JSON text and whether truncation happened. The text is
    /// always at most `size_cap` bytes.
    pub fn encode(&mut self) -> Result<(String, bool), EventBusError> {
        let full = serde_json::to_string(self)?;
        if full.len() <= self.size_cap {
            return Ok((full, false));
        }

        let original_size = full.len();
        self.data = Value::Object(pointer(&self.data, original_size, true));
        let bounded = serde_json::to_string(self)?;
        if bounded.len() <= self.size_cap {
            return Ok((bounded, true));
        }

        // Oversized metadata: drop the retained fields too.
        self.data = Value::Object(pointer(&self.data, original_size, false));
        let minimal = serde_json::to_string(self)?;
        if minimal.len() <= self.size_cap {
            Ok((minimal, true))
        } else {
            Err(EventBusError::Oversized {
                size: minimal.len(),
                cap: self.size_cap,
            })
        }
    }
}

fn pointer(data: &Value, original_size: usize, keep_ids: bool) -> Map<String, Value> {
    let mut out = Map::new();
    if keep_ids {
        if let Some(object) = data.as_object() {
            for field in RETAINED_FIELDS {
                if let Some(value) = object.get(field).filter(|v| is_retainable(v)) {
                    out.insert(field.to_owned(), value.clone());
                }
            }
        }
    }
    out.insert("_truncated".to_owned(), Value::Bool(true));
    out.insert("original_size".to_owned(), Value::from(original_size));
    out
}

fn is_retainable(value: &Value) -> bool {
    match value {
        Value::String(s) => s.len() <= MAX_RETAINED_LEN,
        Value::Number(_) | Value::Bool(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(data: Value) -> DomainEvent {
        DomainEvent::new("call.completed", Uuid::new_v4(), data)
    }

    #[test]
    fn small_envelope_is_untouched() {
        let mut envelope = EventEnvelope::new(event(json!({"id": "c1"})), DEFAULT_SIZE_CAP);
        let (json, truncated) = envelope.encode().unwrap();
        assert!(!truncated);
        let decoded: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.version, ENVELOPE_VERSION);
        assert_eq!(decoded.data, json!({"id": "c1"}));
        assert!(!decoded.is_truncated());
    }

    #[test]
    fn oversized_payload_becomes_pointer() {
        let transcript = "x".repeat(64 * 1024);
        let mut envelope = EventEnvelope::new(
            event(json!({
                "id": "c1",
                "call_id": "call-9",
                "lead_id": "6f1c2a9e-4b7d-4c1a-9e0f-2d3b4c5d6e7f",
                "transcript": transcript,
                "nested": {"id": "dropped"},
            })),
            DEFAULT_SIZE_CAP,
        );
        let (json, truncated) = envelope.encode().unwrap();
        assert!(truncated);
        assert!(json.len() <= DEFAULT_SIZE_CAP);

        let decoded: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert!(decoded.is_truncated());
        assert_eq!(decoded.data["id"], "c1");
        assert_eq!(decoded.data["call_id"], "call-9");
        assert!(decoded.data.get("transcript").is_none());
        assert!(decoded.data.get("nested").is_none());
        assert!(decoded.data["original_size"].as_u64().unwrap() > DEFAULT_SIZE_CAP as u64);
    }

    #[test]
    fn pointer_drops_ids_when_they_do_not_fit() {
        let mut envelope = EventEnvelope::new(
            event(json!({"id": "i".repeat(200), "blob": "y".repeat(600)})),
            400,
        );
        let (json, truncated) = envelope.encode().unwrap();
        assert!(truncated);
        assert!(json.len() <= 400);
        assert!(envelope.is_truncated());
        assert!(envelope.data.get("id").is_none());
    }

    #[test]
    fn impossible_cap_is_an_error() {
        let mut envelope = EventEnvelope::new(event(json!({})), 16);
        assert!(matches!(
            envelope.encode(),
            Err(EventBusError::Oversized { cap: 16, .. })
        ));
    }

    #[test]
    fn channels_are_additive() {
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let lead = Uuid::new_v4();

        let only_tenant = DomainEvent::new("e", tenant, json!({}));
        assert_eq!(only_tenant.channels(), vec![Channel::TenantEvents(tenant)]);

        let all = only_tenant.with_user(user).with_lead(lead);
        assert_eq!(
            all.channels(),
            vec![
                Channel::TenantEvents(tenant),
                Channel::UserTasks(user),
                Channel::LeadTimeline(lead),
            ]
        );
    }

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Severity::Warning).unwrap(), json!("warning"));
        assert_eq!(Severity::default(), Severity::Info);
    }
}

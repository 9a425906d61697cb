//! Socket wire protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::Channel;

/// Client-to-server control frames.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
}

/// Server-to-client frames. Events are framed separately by [`event_frame`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ready {
        connection_id: Uuid,
        tenant_id: Uuid,
        user_id: Uuid,
    },
    Subscribed {
        channel: String,
    },
    Unsubscribed {
        channel: String,
    },
    Pong,
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
}

impl ServerFrame {
    pub fn error(code: &str, message: impl Into<String>, channel: Option<String>) -> Self {
        Self::Error {
            code: code.to_owned(),
            message: message.into(),
            channel,
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings and UUIDs; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Longest channel name, `lead:{uuid}:timeline` or `tenant:{uuid}:events`.
const MAX_CHANNEL_LEN: usize = 50;

/// Bytes [`event_frame`] adds around an envelope, at most.
///
/// Envelopes are bounded to the socket frame cap minus this.
pub const EVENT_FRAME_OVERHEAD: usize =
    r#"{"type":"event","channel":"","event":}"#.len() + MAX_CHANNEL_LEN;

/// Wrap an already-serialized envelope for delivery on `channel`.
///
/// Channel names are grammar-checked and never need escaping.
pub fn event_frame(channel: &Channel, envelope_json: &str) -> String {
    format!(r#"{{"type":"event","channel":"{channel}","event":{envelope_json}}}"#)
}

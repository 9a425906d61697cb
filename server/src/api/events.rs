//! Publish API: `POST /api/events`.
//!
//! Lets internal services announce domain events for the caller's tenant.
//! Honors `Idempotency-Key`: a repeated key replays the original response.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::AppState;
use crate::auth::AuthUser;
use crate::events::{DomainEvent, Severity};
use crate::hub::check_routes;
use crate::idempotency::{is_valid_key, IdempotencyError, Reservation, StoredResponse};
use crate::webhooks::REQUEST_ID_HEADER;

/// Header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Longest accepted event name.
const MAX_EVENT_NAME_LEN: usize = 128;

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub event_name: String,
    #[serde(default)]
    pub data: Value,
    pub user_id: Option<Uuid>,
    pub lead_id: Option<Uuid>,
    pub dedup_key: Option<String>,
    #[serde(default)]
    pub severity: Severity,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{0}")]
    InvalidRequest(&'static str),

    #[error("user or lead is outside the caller's tenant")]
    Forbidden,

    #[error("a request with this idempotency key is still in progress")]
    InProgress,

    #[error("idempotency store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<IdempotencyError> for PublishError {
    fn from(err: IdempotencyError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl IntoResponse for PublishError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            Self::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            Self::InProgress => (StatusCode::CONFLICT, "IN_PROGRESS"),
            Self::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
        };
        (status, Json(json!({ "error": code, "message": self.to_string() }))).into_response()
    }
}

/// Publish a domain event to the caller's tenant.
#[tracing::instrument(skip(state, headers, body), fields(tenant_id = %auth.tenant_id, user_id = %auth.user_id))]
pub async fn publish_event(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(body): Json<PublishRequest>,
) -> Result<Response, PublishError> {
    validate(&body)?;

    let key = match headers.get(IDEMPOTENCY_KEY_HEADER) {
        None => None,
        Some(raw) => {
            let key = raw
                .to_str()
                .ok()
                .filter(|k| is_valid_key(k))
                .ok_or(PublishError::InvalidRequest("malformed Idempotency-Key header"))?;
            Some(key.to_string())
        }
    };

    let trace_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::now_v7().to_string(), str::to_string);
    let event = into_event(body, &auth, trace_id);

    let routes = check_routes(state.directory.as_ref(), &event, Some(auth.user_id))
        .await
        .map_err(|e| PublishError::StoreUnavailable(e.to_string()))?;
    if !routes.all_allowed() {
        warn!(
            security_event = true,
            target_user = ?event.user_id,
            target_lead = ?event.lead_id,
            "Publish outside caller tenant rejected"
        );
        return Err(PublishError::Forbidden);
    }

    let scope = format!("{}:publish", auth.tenant_id);
    let idempotency = &state.config.idempotency;

    if let Some(key) = &key {
        match state.responses.reserve(&scope, key, idempotency.claim_ttl).await? {
            Reservation::Reserved => {}
            Reservation::InProgress => return Err(PublishError::InProgress),
            Reservation::Completed(stored) => return Ok(replay(stored)),
        }
    }

    let channels: Vec<String> = event.channels().iter().map(ToString::to_string).collect();

    if !state.bus.publish(event).await {
        if let Some(key) = &key {
            if let Err(e) = state.responses.abandon(&scope, key).await {
                warn!(error = %e, "Failed to clear idempotency marker");
            }
        }
        let response = (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "UNAVAILABLE", "message": "event could not be published" })),
        );
        return Ok(response.into_response());
    }

    let stored = StoredResponse {
        status: StatusCode::ACCEPTED.as_u16(),
        body: json!({ "published": true, "channels": channels }),
    };
    if let Some(key) = &key {
        if let Err(e) = state
            .responses
            .complete(&scope, key, &stored, idempotency.response_ttl)
            .await
        {
            warn!(error = %e, "Failed to store idempotent response");
        }
    }
    Ok(replay(stored))
}

fn validate(body: &PublishRequest) -> Result<(), PublishError> {
    let name = body.event_name.as_str();
    if name.is_empty() || name.len() > MAX_EVENT_NAME_LEN {
        return Err(PublishError::InvalidRequest("event_name must be 1-128 characters"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return Err(PublishError::InvalidRequest(
            "event_name may only contain letters, digits, '.', '_' and '-'",
        ));
    }
    Ok(())
}

fn into_event(body: PublishRequest, auth: &AuthUser, trace_id: String) -> DomainEvent {
    let mut event = DomainEvent::new(body.event_name, auth.tenant_id, body.data)
        .with_severity(body.severity)
        .with_trace_id(trace_id);
    if let Some(user_id) = body.user_id {
        event = event.with_user(user_id);
    }
    if let Some(lead_id) = body.lead_id {
        event = event.with_lead(lead_id);
    }
    if let Some(dedup_key) = body.dedup_key {
        event = event.with_dedup_key(dedup_key);
    }
    event
}

fn replay(stored: StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    (status, Json(stored.body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str) -> PublishRequest {
        PublishRequest {
            event_name: name.into(),
            data: json!({}),
            user_id: None,
            lead_id: None,
            dedup_key: None,
            severity: Severity::Info,
        }
    }

    #[test]
    fn event_names_are_validated() {
        assert!(validate(&request("task.created")).is_ok());
        assert!(validate(&request("")).is_err());
        assert!(validate(&request("has space")).is_err());
        assert!(validate(&request(&"a".repeat(129))).is_err());
    }

    #[test]
    fn event_is_scoped_to_caller_tenant() {
        let auth = AuthUser {
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
        };
        let mut body = request("task.created");
        body.user_id = Some(auth.user_id);
        let event = into_event(body, &auth, "trace".into());

        assert_eq!(event.tenant_id, auth.tenant_id);
        assert_eq!(event.channels().len(), 2);
        assert_eq!(event.trace_id.as_deref(), Some("trace"));
    }
}

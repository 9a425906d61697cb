//! Webhook ingestion errors and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::idempotency::IdempotencyError;
use crate::ratelimit::{RateLimitError, RateLimitResult};
use crate::signature::SignatureError;

/// Failure of a downstream webhook handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("downstream request failed: {0}")]
    Downstream(String),

    #[error("downstream rejected delivery with HTTP {0}")]
    Rejected(u16),

    #[error("outbound rate limit exceeded")]
    RateLimited,

    #[error("handler timed out")]
    Timeout,
}

impl From<reqwest::Error> for HandlerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Downstream(err.to_string())
        }
    }
}

/// Reasons an inbound delivery is not processed.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("tenant id is not a UUID")]
    InvalidTenant,

    #[error("rate limit exceeded")]
    RateLimited(RateLimitResult),

    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("delivery is being processed by another worker")]
    InProgress,

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
}

impl IngestError {
    /// Label used for the webhook outcome metric.
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Signature(_) | Self::InvalidTenant => "rejected",
            Self::RateLimited(_) => "rate_limited",
            Self::StoreUnavailable(_) => "unavailable",
            Self::InProgress => "in_progress",
            Self::Handler(_) => "handler_failed",
        }
    }
}

impl From<IdempotencyError> for IngestError {
    fn from(err: IdempotencyError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<RateLimitError> for IngestError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::LimitExceeded(result) => Self::RateLimited(result),
            RateLimitError::StoreUnavailable(reason) => Self::StoreUnavailable(reason),
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Signature(SignatureError::UnknownProvider(_)) => (
                StatusCode::NOT_FOUND,
                json!({"error": "unknown_provider", "message": self.to_string()}),
            ),
            Self::Signature(e) => (
                StatusCode::UNAUTHORIZED,
                json!({"error": e.as_str(), "message": "webhook authentication failed"}),
            ),
            Self::InvalidTenant => (
                StatusCode::NOT_FOUND,
                json!({"error": "invalid_tenant", "message": self.to_string()}),
            ),
            Self::RateLimited(result) => {
                return RateLimitError::LimitExceeded(result.clone()).into_response();
            }
            Self::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": "store_unavailable", "message": "try again later"}),
            ),
            Self::InProgress => (StatusCode::CONFLICT, json!({"status": "in_progress"})),
            Self::Handler(_) => (
                StatusCode::BAD_GATEWAY,
                json!({"error": "handler_failed", "message": "delivery was not processed"}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

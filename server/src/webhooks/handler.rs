//! Handlers invoked once per freshly claimed delivery.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use super::error::HandlerError;
use super::types::WebhookDelivery;
use crate::events::DomainEvent;
use crate::ratelimit::{RateLimitCategory, RateLimitError, RateLimiter};

/// External collaborator that does the actual work for a delivery.
///
/// Runs at most once per successful commit. Returns the domain event to
/// publish; an error releases the claim so the provider's retry re-runs it.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, delivery: &WebhookDelivery) -> Result<DomainEvent, HandlerError>;
}

/// Accepts every delivery and only announces it on the bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgeHandler;

#[async_trait]
impl WebhookHandler for AcknowledgeHandler {
    async fn handle(&self, delivery: &WebhookDelivery) -> Result<DomainEvent, HandlerError> {
        Ok(delivery.domain_event())
    }
}

/// Forwards deliveries to the downstream analysis service.
#[derive(Clone)]
pub struct ForwardingHandler {
    client: reqwest::Client,
    url: String,
    rate_limiter: RateLimiter,
}

impl ForwardingHandler {
    pub fn new(url: impl Into<String>, timeout: Duration, rate_limiter: RateLimiter) -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            rate_limiter,
        })
    }
}

#[async_trait]
impl WebhookHandler for ForwardingHandler {
    #[tracing::instrument(skip(self, delivery), fields(tenant_id = %delivery.tenant_id, provider = %delivery.provider))]
    async fn handle(&self, delivery: &WebhookDelivery) -> Result<DomainEvent, HandlerError> {
        match self
            .rate_limiter
            .admit(RateLimitCategory::OutboundTenant, &delivery.tenant_id.to_string())
            .await
        {
            Ok(_) => {}
            Err(RateLimitError::LimitExceeded(_)) => return Err(HandlerError::RateLimited),
            Err(RateLimitError::StoreUnavailable(reason)) => {
                return Err(HandlerError::Downstream(reason))
            }
        }

        let response = self
            .client
            .post(&self.url)
            .header("X-Request-Id", &delivery.trace_id)
            .header(
                "Idempotency-Key",
                format!("{}:{}", delivery.provider, delivery.external_id),
            )
            .json(&json!({
                "tenant_id": delivery.tenant_id,
                "provider": delivery.provider,
                "external_id": delivery.external_id,
                "attempts": delivery.attempts,
                "payload": delivery.payload,
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "Delivery forwarded downstream");
            Ok(delivery.domain_event())
        } else {
            warn!(status = status.as_u16(), "Downstream rejected delivery");
            Err(HandlerError::Rejected(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::ratelimit::{LimitConfig, MemoryWindowStore, RateLimitConfig};

    fn delivery() -> WebhookDelivery {
        WebhookDelivery {
            tenant_id: Uuid::new_v4(),
            provider: "dialer".into(),
            external_id: "d-1".into(),
            attempts: 1,
            trace_id: "t".into(),
            payload: json!({"event": "call.ended"}),
        }
    }

    #[tokio::test]
    async fn acknowledge_emits_domain_event() {
        let event = AcknowledgeHandler.handle(&delivery()).await.unwrap();
        assert_eq!(event.event_name, "dialer.call.ended");
    }

    #[tokio::test]
    async fn forwarding_respects_outbound_limit() {
        let mut config = RateLimitConfig::for_test();
        config.limits.outbound_tenant = LimitConfig {
            requests: 0,
            window_secs: 60,
        };
        let limiter = RateLimiter::new(Arc::new(MemoryWindowStore::new()), config);
        // Port 9 (discard) is never contacted; the limiter denies first.
        let handler =
            ForwardingHandler::new("http://127.0.0.1:9/ingest", Duration::from_secs(1), limiter)
                .unwrap();

        assert_eq!(
            handler.handle(&delivery()).await,
            Err(HandlerError::RateLimited)
        );
    }

    #[tokio::test]
    async fn forwarding_to_unreachable_downstream_fails() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryWindowStore::new()),
            RateLimitConfig::for_test(),
        );
        let handler =
            ForwardingHandler::new("http://127.0.0.1:9/ingest", Duration::from_secs(1), limiter)
                .unwrap();
        assert!(handler.handle(&delivery()).await.is_err());
    }
}

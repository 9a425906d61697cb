//! Webhook ingestion pipeline.
//!
//! verify → rate limit → claim → handle → commit → publish. Every stage that
//! rejects a delivery maps to one [`IngestError`] variant.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use tracing::{debug, info, warn, Span};
use uuid::Uuid;

use super::error::{HandlerError, IngestError};
use super::handler::WebhookHandler;
use super::types::{IngestStatus, WebhookDelivery};
use crate::api::AppState;
use crate::events::{DomainEvent, EventBus};
use crate::hub::{check_routes, AccessDirectory};
use crate::idempotency::{ClaimGuard, ClaimOutcome, IdempotencyKey, IdempotencyLedger};
use crate::observability::metrics;
use crate::ratelimit::{RateLimitCategory, RateLimiter};
use crate::signature::SignatureVerifier;
use crate::util::with_timeout;

/// Header carrying the per-request trace id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Everything a delivery passes through, shared by all requests.
#[derive(Clone)]
pub struct IngestPipeline {
    verifier: Arc<SignatureVerifier>,
    rate_limiter: RateLimiter,
    ledger: Arc<dyn IdempotencyLedger>,
    handler: Arc<dyn WebhookHandler>,
    bus: EventBus,
    directory: Arc<dyn AccessDirectory>,
    claim_ttl: Duration,
    handler_timeout: Duration,
}

impl IngestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: Arc<SignatureVerifier>,
        rate_limiter: RateLimiter,
        ledger: Arc<dyn IdempotencyLedger>,
        handler: Arc<dyn WebhookHandler>,
        bus: EventBus,
        directory: Arc<dyn AccessDirectory>,
        claim_ttl: Duration,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            rate_limiter,
            ledger,
            handler,
            bus,
            directory,
            claim_ttl,
            handler_timeout,
        }
    }

    /// Ingest one delivery and record its outcome.
    #[tracing::instrument(skip(self, headers, body), fields(provider = %provider, tenant_id = %tenant_id))]
    pub async fn ingest(
        &self,
        provider: &str,
        tenant_id: Uuid,
        headers: &HeaderMap,
        body: &[u8],
        trace_id: &str,
    ) -> Result<IngestStatus, IngestError> {
        let result = self.run(provider, tenant_id, headers, body, trace_id).await;
        match &result {
            Ok(status) => metrics::record_webhook_outcome(provider, status.as_str()),
            Err(e) => metrics::record_webhook_outcome(provider, e.outcome()),
        }
        result
    }

    async fn run(
        &self,
        provider: &str,
        tenant_id: Uuid,
        headers: &HeaderMap,
        body: &[u8],
        trace_id: &str,
    ) -> Result<IngestStatus, IngestError> {
        let verified = self.verifier.verify(provider, headers, body).map_err(|e| {
            metrics::record_signature_failure(provider, e.as_str());
            e
        })?;

        self.rate_limiter
            .admit(RateLimitCategory::WebhookTenant, &tenant_id.to_string())
            .await?;

        let key = IdempotencyKey::new(tenant_id, provider, verified.external_id);
        let outcome = self.ledger.claim(&key, self.claim_ttl).await?;
        metrics::record_idempotency_outcome(outcome.as_str());

        let claim = match outcome {
            ClaimOutcome::Fresh(claim) => claim,
            ClaimOutcome::Duplicate { in_flight: true } => {
                debug!(external_id = %key.external_id, "Delivery already in flight");
                return Err(IngestError::InProgress);
            }
            ClaimOutcome::Duplicate { in_flight: false } => {
                debug!(external_id = %key.external_id, "Duplicate delivery ignored");
                return Ok(IngestStatus::DuplicateIgnored);
            }
        };

        let delivery = WebhookDelivery {
            tenant_id,
            provider: provider.to_string(),
            external_id: key.external_id.clone(),
            attempts: claim.attempts,
            trace_id: trace_id.to_string(),
            payload: serde_json::from_slice(body).unwrap_or(Value::Null),
        };

        // Released on drop if this future is cancelled mid-handler.
        let guard = ClaimGuard::new(Arc::clone(&self.ledger), claim);
        let handled = with_timeout(
            self.handler_timeout,
            self.handler.handle(&delivery),
            || HandlerError::Timeout,
        )
        .await;
        let claim = guard.disarm();

        let event = match handled {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    external_id = %delivery.external_id,
                    attempts = delivery.attempts,
                    error = %e,
                    "Webhook handler failed, releasing claim"
                );
                if let Err(release_err) = self.ledger.release(&claim).await {
                    warn!(error = %release_err, "Failed to release claim; it will lapse at its TTL");
                }
                return Err(e.into());
            }
        };

        if !self.ledger.commit(&claim).await? {
            warn!(
                external_id = %delivery.external_id,
                "Claim was already committed by another worker"
            );
        }

        let event = self.confine_to_tenant(event).await;
        if !self.bus.publish(event).await {
            warn!(external_id = %delivery.external_id, "Processed delivery could not be announced");
        }

        info!(
            external_id = %delivery.external_id,
            attempts = delivery.attempts,
            "Webhook delivery processed"
        );
        Ok(IngestStatus::Processed)
    }

    /// Drop user and lead targets that do not belong to the delivery's tenant.
    ///
    /// Provider payloads name them; only the tenant channel is trusted.
    async fn confine_to_tenant(&self, mut event: DomainEvent) -> DomainEvent {
        let routes = match check_routes(self.directory.as_ref(), &event, None).await {
            Ok(routes) => routes,
            Err(e) => {
                warn!(error = %e, "Directory unavailable, announcing on the tenant channel only");
                event.user_id = None;
                event.lead_id = None;
                return event;
            }
        };
        if !routes.user_allowed {
            warn!(security_event = true, target_user = ?event.user_id, "Foreign user target dropped");
            event.user_id = None;
        }
        if !routes.lead_allowed {
            warn!(security_event = true, target_lead = ?event.lead_id, "Foreign lead target dropped");
            event.lead_id = None;
        }
        event
    }
}

/// `POST /webhooks/{provider}/{tenant_id}`
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path((provider, tenant_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, IngestError> {
    let tenant_id = Uuid::try_parse(&tenant_id).map_err(|_| IngestError::InvalidTenant)?;
    Span::current()
        .record("provider", provider.as_str())
        .record("tenant_id", tracing::field::display(tenant_id));
    let trace_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::now_v7().to_string(), str::to_string);

    let status = state
        .pipeline
        .ingest(&provider, tenant_id, &headers, &body, &trace_id)
        .await?;
    Ok(Json(json!({ "status": status.as_str() })))
}

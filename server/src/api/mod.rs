//! API Router and Application State
//!
//! Central routing configuration and shared state.

mod backends;
pub mod events;

pub use backends::{Backends, BusSource, Stores};

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    extract::State,
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    auth,
    config::Config,
    events::EventBus,
    hub::{self, AccessDirectory, SubscriptionHub, EVENT_FRAME_OVERHEAD},
    idempotency::ResponseCache,
    observability,
    ratelimit::{rate_limit_publish, RateLimiter},
    signature::SignatureVerifier,
    webhooks::{self, AcknowledgeHandler, ForwardingHandler, IngestPipeline, WebhookHandler},
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Rate limiter shared by every entry point
    pub rate_limiter: RateLimiter,
    /// `Idempotency-Key` response cache for the publish API
    pub responses: Arc<dyn ResponseCache>,
    /// Event bus for domain events
    pub bus: EventBus,
    /// Live WebSocket connections of this process
    pub hub: SubscriptionHub,
    /// Tenant membership and lead ownership
    pub directory: Arc<dyn AccessDirectory>,
    /// Webhook ingestion pipeline
    pub pipeline: IngestPipeline,
    /// Postgres and Redis, absent with in-memory backends
    pub stores: Option<Stores>,
}

impl AppState {
    /// Assemble application state over the given backends.
    pub fn new(config: Config, backends: &Backends) -> anyhow::Result<Self> {
        let verifier = Arc::new(SignatureVerifier::builtin(
            &config.webhook_secrets,
            config.environment,
            config.max_skew,
        )?);

        let handler: Arc<dyn WebhookHandler> = match &config.downstream_url {
            Some(url) => {
                info!(url = %url, "Forwarding webhook deliveries downstream");
                Arc::new(ForwardingHandler::new(
                    url.clone(),
                    config.handler_timeout,
                    backends.rate_limiter.clone(),
                )?)
            }
            None => Arc::new(AcknowledgeHandler),
        };

        // Envelopes leave room for the socket frame wrapper.
        let bus = EventBus::new(
            Arc::clone(&backends.transport),
            config.event_size_cap.saturating_sub(EVENT_FRAME_OVERHEAD),
        );
        let hub = SubscriptionHub::new(Arc::clone(&backends.directory), config.hub.clone());
        let pipeline = IngestPipeline::new(
            verifier,
            backends.rate_limiter.clone(),
            Arc::clone(&backends.ledger),
            handler,
            bus.clone(),
            Arc::clone(&backends.directory),
            config.idempotency.claim_ttl,
            config.handler_timeout,
        );

        Ok(Self {
            config: Arc::new(config),
            rate_limiter: backends.rate_limiter.clone(),
            responses: Arc::clone(&backends.responses),
            bus,
            hub,
            directory: Arc::clone(&backends.directory),
            pipeline,
            stores: backends.stores.clone(),
        })
    }
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let max_body_bytes = state.config.max_body_bytes;

    // Auth runs first, then per-user and per-tenant publish limits
    let publish_routes = Router::new()
        .route("/api/events", post(events::publish_event))
        .layer(from_fn_with_state(state.clone(), rate_limit_publish))
        .layer(from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Provider webhooks (authenticated by signature)
        .route("/webhooks/{provider}/{tenant_id}", post(webhooks::receive_webhook))
        .merge(publish_routes)
        // WebSocket
        .route("/ws", get(hub::ws_handler))
        // Middleware
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http().make_span_with(observability::tracing::http_span))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        // State
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    /// Service status
    status: &'static str,
    /// Whether rate limiting is enabled
    rate_limiting: bool,
    /// Live WebSocket connections on this instance
    connections: usize,
    /// Postgres reachable; absent with in-memory backends
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<bool>,
    /// Redis connected; absent with in-memory backends
    #[serde(skip_serializing_if = "Option::is_none")]
    redis: Option<bool>,
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (database, redis) = match &state.stores {
        Some(stores) => {
            let (pg, redis) = crate::db::ping(&stores.db, &stores.redis).await;
            (Some(pg), Some(redis))
        }
        None => (None, None),
    };
    let degraded = database == Some(false) || redis == Some(false);

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" },
        rate_limiting: state.rate_limiter.config().enabled,
        connections: state.hub.connection_count(),
        database,
        redis,
    })
}

//! OpenTelemetry meter provider initialization and application instruments.
//!
//! Instruments live in `OnceLock` statics registered by [`register_metrics`].
//! Every `record_*` function is a no-op until registration, so library code and
//! unit tests can call them freely.

use std::sync::OnceLock;

use opentelemetry::metrics::{Counter, UpDownCounter};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::metrics::data::ResourceMetrics;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::Resource;
use sqlx::PgPool;

use crate::config::ObservabilityConfig;

const METER_NAME: &str = "sb-server";

// ============================================================================
// Ingestion
// ============================================================================

static WEBHOOK_DELIVERIES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
static SIGNATURE_FAILURES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
static IDEMPOTENCY_CLAIMS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

// ============================================================================
// Coordination
// ============================================================================

static LEASE_OPERATIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
static RATE_LIMIT_DECISIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

// ============================================================================
// Fanout
// ============================================================================

static EVENTS_PUBLISHED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
static EVENTS_TRUNCATED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
static WS_CONNECTIONS_ACTIVE: OnceLock<UpDownCounter<i64>> = OnceLock::new();
static WS_CONNECTIONS_CLOSED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
static WS_MESSAGES_DROPPED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

static OTEL_EXPORT_FAILURES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

/// Build a [`Resource`] describing this service instance for metrics.
///
/// Uses the same attributes as the tracer resource so all telemetry signals
/// correlate under the same service identity.
fn build_resource(config: &ObservabilityConfig) -> Resource {
    let deployment_env =
        std::env::var("DEPLOYMENT_ENVIRONMENT").unwrap_or_else(|_| "local".to_owned());

    Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes([
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment", deployment_env),
        ])
        .build()
}

/// Initialise the global `OTel` [`SdkMeterProvider`].
///
/// Returns `Ok(None)` when `config.enabled` is `false`; the global meter
/// provider is then the no-op default and every instrument records nothing.
///
/// The caller should retain the returned provider and call
/// [`SdkMeterProvider::shutdown`] during graceful shutdown.
pub fn init(config: &ObservabilityConfig) -> anyhow::Result<Option<SdkMeterProvider>> {
    if !config.enabled {
        return Ok(None);
    }

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()?;

    // `with_periodic_exporter` defaults to a 60-second interval.
    // Override by setting `OTEL_METRIC_EXPORT_INTERVAL` (milliseconds).
    let provider = SdkMeterProvider::builder()
        .with_resource(build_resource(config))
        .with_periodic_exporter(FailureCountingMetricExporter::new(exporter))
        .build();

    global::set_meter_provider(provider.clone());

    Ok(Some(provider))
}

/// Registers all application metrics. Call once at startup after `init()`.
pub fn register_metrics() {
    let meter = global::meter(METER_NAME);

    WEBHOOK_DELIVERIES_TOTAL.get_or_init(|| {
        meter
            .u64_counter("sb_webhook_deliveries_total")
            .with_description("Webhook deliveries by provider and outcome")
            .build()
    });

    SIGNATURE_FAILURES_TOTAL.get_or_init(|| {
        meter
            .u64_counter("sb_signature_failures_total")
            .with_description("Rejected webhook signatures by provider and reason")
            .build()
    });

    IDEMPOTENCY_CLAIMS_TOTAL.get_or_init(|| {
        meter
            .u64_counter("sb_idempotency_claims_total")
            .with_description("Idempotency claims by outcome")
            .build()
    });

    LEASE_OPERATIONS_TOTAL.get_or_init(|| {
        meter
            .u64_counter("sb_lease_operations_total")
            .with_description("Lease acquire/release/extend outcomes")
            .build()
    });

    RATE_LIMIT_DECISIONS_TOTAL.get_or_init(|| {
        meter
            .u64_counter("sb_rate_limit_decisions_total")
            .with_description("Rate limiter decisions by category and outcome")
            .build()
    });

    EVENTS_PUBLISHED_TOTAL.get_or_init(|| {
        meter
            .u64_counter("sb_events_published_total")
            .with_description("Per-channel event publishes by outcome")
            .build()
    });

    EVENTS_TRUNCATED_TOTAL.get_or_init(|| {
        meter
            .u64_counter("sb_events_truncated_total")
            .with_description("Events whose payload exceeded the size cap")
            .build()
    });

    WS_CONNECTIONS_ACTIVE.get_or_init(|| {
        meter
            .i64_up_down_counter("sb_ws_connections_active")
            .with_description("Current open WebSocket connections")
            .build()
    });

    WS_CONNECTIONS_CLOSED_TOTAL.get_or_init(|| {
        meter
            .u64_counter("sb_ws_connections_closed_total")
            .with_description("Closed WebSocket connections by reason")
            .build()
    });

    WS_MESSAGES_DROPPED_TOTAL.get_or_init(|| {
        meter
            .u64_counter("sb_ws_messages_dropped_total")
            .with_description("Outbound messages dropped on a full connection queue")
            .build()
    });

    OTEL_EXPORT_FAILURES_TOTAL.get_or_init(|| {
        meter
            .u64_counter("sb_otel_export_failures_total")
            .with_description("OTLP export failures from the SDK")
            .build()
    });
}

/// Register database pool metrics as observable gauges with callbacks.
///
/// Call once at startup after pool creation and `register_metrics()`.
pub fn register_db_pool_metrics(pool: PgPool) {
    let meter = global::meter(METER_NAME);

    let pool_active = pool.clone();
    meter
        .u64_observable_gauge("sb_db_pool_connections_active")
        .with_description("Active database pool connections")
        .with_callback(move |observer| {
            observer.observe(u64::from(pool_active.size()), &[]);
        })
        .build();

    meter
        .u64_observable_gauge("sb_db_pool_connections_idle")
        .with_description("Idle database pool connections")
        .with_callback(move |observer| {
            observer.observe(pool.num_idle() as u64, &[]);
        })
        .build();
}

// ============================================================================
// Recording functions
// ============================================================================

/// Record the final outcome of a webhook delivery.
pub fn record_webhook_outcome(provider: &str, outcome: &'static str) {
    if let Some(counter) = WEBHOOK_DELIVERIES_TOTAL.get() {
        counter.add(
            1,
            &[
                KeyValue::new("provider", provider.to_owned()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}

/// Record a rejected signature.
pub fn record_signature_failure(provider: &str, reason: &'static str) {
    if let Some(counter) = SIGNATURE_FAILURES_TOTAL.get() {
        counter.add(
            1,
            &[
                KeyValue::new("provider", provider.to_owned()),
                KeyValue::new("reason", reason),
            ],
        );
    }
}

/// Record an idempotency claim outcome (`fresh`, `duplicate`, `in_flight`, `unavailable`).
pub fn record_idempotency_outcome(outcome: &'static str) {
    if let Some(counter) = IDEMPOTENCY_CLAIMS_TOTAL.get() {
        counter.add(1, &[KeyValue::new("outcome", outcome)]);
    }
}

/// Record a lease operation outcome.
pub fn record_lease_outcome(outcome: &'static str) {
    if let Some(counter) = LEASE_OPERATIONS_TOTAL.get() {
        counter.add(1, &[KeyValue::new("outcome", outcome)]);
    }
}

/// Record a rate limiter decision.
pub fn record_rate_limit_decision(category: &'static str, outcome: &'static str) {
    if let Some(counter) = RATE_LIMIT_DECISIONS_TOTAL.get() {
        counter.add(
            1,
            &[
                KeyValue::new("category", category),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}

/// Record a single channel publish.
pub fn record_event_published(channel_kind: &'static str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    if let Some(counter) = EVENTS_PUBLISHED_TOTAL.get() {
        counter.add(
            1,
            &[
                KeyValue::new("channel_kind", channel_kind),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}

/// Record an event whose payload was replaced by a truncation pointer.
pub fn record_event_truncated() {
    if let Some(counter) = EVENTS_TRUNCATED_TOTAL.get() {
        counter.add(1, &[]);
    }
}

/// Record a new WebSocket connection.
pub fn record_ws_connect() {
    if let Some(counter) = WS_CONNECTIONS_ACTIVE.get() {
        counter.add(1, &[]);
    }
}

/// Record a WebSocket disconnection with its close reason.
pub fn record_ws_disconnect(reason: &'static str) {
    if let Some(counter) = WS_CONNECTIONS_ACTIVE.get() {
        counter.add(-1, &[]);
    }
    if let Some(counter) = WS_CONNECTIONS_CLOSED_TOTAL.get() {
        counter.add(1, &[KeyValue::new("reason", reason)]);
    }
}

/// Record an outbound message dropped because the connection queue was full.
pub fn record_ws_dropped() {
    if let Some(counter) = WS_MESSAGES_DROPPED_TOTAL.get() {
        counter.add(1, &[]);
    }
}

/// Record an `OTel` export failure.
pub fn record_otel_export_failure() {
    if let Some(counter) = OTEL_EXPORT_FAILURES_TOTAL.get() {
        counter.add(1, &[]);
    }
}

// ============================================================================
// OTel metric exporter wrapper for failure counting
// ============================================================================

/// Wraps an OTLP `MetricExporter` to count export failures.
#[derive(Debug)]
pub struct FailureCountingMetricExporter<E> {
    inner: E,
}

impl<E> FailureCountingMetricExporter<E> {
    pub const fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<E: PushMetricExporter> PushMetricExporter for FailureCountingMetricExporter<E> {
    async fn export(
        &self,
        metrics: &mut ResourceMetrics,
    ) -> opentelemetry_sdk::error::OTelSdkResult {
        let result = self.inner.export(metrics).await;
        if result.is_err() {
            record_otel_export_failure();
        }
        result
    }

    fn force_flush(&self) -> opentelemetry_sdk::error::OTelSdkResult {
        self.inner.force_flush()
    }

    fn shutdown(&self) -> opentelemetry_sdk::error::OTelSdkResult {
        self.inner.shutdown()
    }

    fn temporality(&self) -> opentelemetry_sdk::metrics::Temporality {
        self.inner.temporality()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_functions_without_init_do_not_panic() {
        record_webhook_outcome("callflow", "processed");
        record_signature_failure("dialer", "bad_signature");
        record_idempotency_outcome("fresh");
        record_lease_outcome("acquired");
        record_rate_limit_decision("webhook_tenant", "denied");
        record_event_published("tenant", true);
        record_event_truncated();
        record_ws_connect();
        record_ws_disconnect("client_closed");
        record_ws_dropped();
        record_otel_export_failure();
    }

    #[test]
    fn register_metrics_does_not_panic() {
        register_metrics();
        // Second call hits the initialised OnceLocks.
        register_metrics();
        record_webhook_outcome("callflow", "processed");
        record_ws_connect();
        record_ws_disconnect("idle_timeout");
    }
}

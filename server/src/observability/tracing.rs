//! Log and span pipeline.
//!
//! Every request runs inside an `http_request` span carrying the request's
//! `trace_id` (its `X-Request-Id`); handlers fill in `provider`, `tenant_id`
//! and `user_id` once they know them. Log lines are JSON on stdout with the
//! whole span chain attached, so a delivery can be followed from the HTTP
//! edge through claim, handler and publish by `trace_id`.
//!
//! With OTLP export enabled the same spans and log records also go to the
//! collector. Attributes whose key names secret material are dropped before
//! export.

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use opentelemetry::KeyValue;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::trace::{BatchSpanProcessor, Sampler, SdkTracerProvider, SpanData, SpanExporter};
use opentelemetry_sdk::Resource;
use tracing::field::Empty;
use tracing::Span;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::ObservabilityConfig;
use crate::webhooks::REQUEST_ID_HEADER;

/// Attribute key fragments never exported.
const SECRET_KEY_FRAGMENTS: [&str; 8] = [
    "token",
    "secret",
    "signature",
    "authorization",
    "credential",
    "body",
    "payload",
    "password",
];

/// Crates whose internal spans drown the service's own.
const QUIET_CRATES: &str = "hyper=off,h2=off,tonic=off,tower=warn,sqlx=warn,fred=warn";

/// Keeps the `OTel` providers alive; flushes and shuts them down on drop.
///
/// Hold it until the end of `main`.
pub struct OtelGuard {
    providers: Option<Providers>,
}

struct Providers {
    tracer: SdkTracerProvider,
    logger: SdkLoggerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        let Some(providers) = self.providers.take() else {
            return;
        };
        if let Err(e) = providers.tracer.shutdown() {
            tracing::warn!(error = %e, "OTel tracer provider shutdown error");
        }
        if let Err(e) = providers.logger.shutdown() {
            tracing::warn!(error = %e, "OTel logger provider shutdown error");
        }
    }
}

/// Root span for one HTTP request, used as the `TraceLayer` span factory.
///
/// `provider`, `tenant_id` and `user_id` start empty and are recorded by the
/// webhook route and the auth middleware.
pub fn http_span(request: &Request<Body>) -> Span {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);
    let trace_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    tracing::info_span!(
        "http_request",
        method = %request.method(),
        route,
        trace_id,
        provider = Empty,
        tenant_id = Empty,
        user_id = Empty,
    )
}

fn is_secret_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SECRET_KEY_FRAGMENTS.iter().any(|fragment| lowered.contains(fragment))
}

fn scrub(attributes: &mut Vec<KeyValue>) {
    attributes.retain(|kv| !is_secret_key(kv.key.as_str()));
}

/// Span exporter that drops secret-bearing attributes before handing the
/// batch to the OTLP exporter.
#[derive(Debug)]
struct ScrubbingExporter<E>(E);

impl<E: SpanExporter> SpanExporter for ScrubbingExporter<E> {
    async fn export(&self, mut batch: Vec<SpanData>) -> OTelSdkResult {
        for span in &mut batch {
            scrub(&mut span.attributes);
            span.events.events.iter_mut().for_each(|e| scrub(&mut e.attributes));
            span.links.links.iter_mut().for_each(|l| scrub(&mut l.attributes));
        }
        self.0.export(batch).await
    }

    fn shutdown(&mut self) -> OTelSdkResult {
        self.0.shutdown()
    }

    fn force_flush(&mut self) -> OTelSdkResult {
        self.0.force_flush()
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.0.set_resource(resource);
    }
}

impl Providers {
    fn build(config: &ObservabilityConfig) -> anyhow::Result<Self> {
        let resource = Resource::builder()
            .with_service_name(config.service_name.clone())
            .with_attributes([
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                KeyValue::new(
                    "deployment.environment",
                    std::env::var("DEPLOYMENT_ENVIRONMENT").unwrap_or_else(|_| "local".to_owned()),
                ),
            ])
            .build();

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&config.otlp_endpoint)
            .build()?;
        let tracer = SdkTracerProvider::builder()
            .with_resource(resource.clone())
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                config.trace_sample_ratio,
            ))))
            .with_span_processor(BatchSpanProcessor::builder(ScrubbingExporter(spans)).build())
            .build();

        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(&config.otlp_endpoint)
            .build()?;
        let logger = SdkLoggerProvider::builder()
            .with_resource(resource)
            .with_batch_exporter(logs)
            .build();

        Ok(Self { tracer, logger })
    }
}

/// Install the global subscriber.
///
/// JSON stdout is always on; the OTLP span and log layers are added only when
/// `config.enabled`.
pub fn init(config: &ObservabilityConfig) -> anyhow::Result<OtelGuard> {
    let providers = if config.enabled {
        Some(Providers::build(config)?)
    } else {
        None
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},{QUIET_CRATES}", config.log_level)));
    let stdout = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(false)
        .with_span_list(true);
    let otel_spans = providers.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(opentelemetry::trace::TracerProvider::tracer(
            &p.tracer,
            "sb-server",
        ))
    });
    let otel_logs = providers
        .as_ref()
        .map(|p| OpenTelemetryTracingBridge::new(&p.logger));

    Registry::default()
        .with(filter)
        .with(otel_spans)
        .with(otel_logs)
        .with(stdout)
        .init();

    Ok(OtelGuard { providers })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_keys_are_scrubbed() {
        let mut attributes = vec![
            KeyValue::new("http.request.body", "{}"),
            KeyValue::new("x_callflow_signature", "abc"),
            KeyValue::new("webhook_secret", "s"),
            KeyValue::new("tenant_id", "t"),
            KeyValue::new("provider", "dialer"),
            KeyValue::new("trace_id", "r-1"),
        ];
        scrub(&mut attributes);

        let kept: Vec<&str> = attributes.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(kept, vec!["tenant_id", "provider", "trace_id"]);
    }

    #[test]
    fn http_span_reads_request_id() {
        let subscriber = tracing_subscriber::registry();
        tracing::subscriber::with_default(subscriber, || {
            let request = Request::builder()
                .uri("/webhooks/dialer/abc")
                .header(REQUEST_ID_HEADER, "req-7")
                .body(Body::empty())
                .unwrap();
            let span = http_span(&request);
            assert_eq!(span.metadata().map(|m| m.name()), Some("http_request"));
            for field in ["trace_id", "provider", "tenant_id", "user_id"] {
                assert!(span.has_field(field), "{field}");
            }
        });
    }

    #[test]
    fn sensitive_arguments_stay_out_of_spans() {
        let pipeline = include_str!("../webhooks/pipeline.rs");
        assert!(pipeline.contains("#[tracing::instrument(skip(self, headers, body)"));

        let publish = include_str!("../api/events.rs");
        assert!(publish.contains("#[tracing::instrument(skip(state, headers, body)"));
    }
}

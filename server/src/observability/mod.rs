//! Observability module: OpenTelemetry tracing, metrics, and logging.
//!
//! # Quick start
//!
//! ```rust,no_run
//! # use sb_server::{config::ObservabilityConfig, observability};
//! # fn main() -> anyhow::Result<()> {
//! # let config = ObservabilityConfig {
//! #     enabled: false,
//! #     otlp_endpoint: String::new(),
//! #     service_name: String::new(),
//! #     trace_sample_ratio: 0.1,
//! #     log_level: "info".into(),
//! # };
//! // In main(), before any logging:
//! let (_otel_guard, _meter_provider) = observability::init(&config)?;
//! // `_otel_guard` must stay alive until the end of `main`.
//! # Ok(())
//! # }
//! ```

pub mod metrics;
pub mod tracing;

use opentelemetry_sdk::metrics::SdkMeterProvider;
pub use tracing::OtelGuard;

use crate::config::ObservabilityConfig;

/// Initialise all observability subsystems.
///
/// Calls [`tracing::init`] and [`metrics::init`] in that order so log output
/// from metric initialisation is captured, then registers the application
/// instruments.
///
/// # Returns
/// * `OtelGuard`: drop-on-exit guard; keep it alive for the lifetime of
///   `main` so providers flush and shut down gracefully.
/// * `Option<SdkMeterProvider>`: `Some` when OTLP export is enabled.
pub fn init(
    config: &ObservabilityConfig,
) -> anyhow::Result<(OtelGuard, Option<SdkMeterProvider>)> {
    let guard = tracing::init(config)?;
    let meter_provider = metrics::init(config)?;
    metrics::register_metrics();
    Ok((guard, meter_provider))
}

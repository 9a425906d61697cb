//! Switchboard Server - Main Entry Point
//!
//! Webhook ingestion and real-time event fanout backend.

use anyhow::Result;
use fred::prelude::ClientLike;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sb_server::{
    api, config, hub::CloseReason, idempotency, observability, ratelimit::RateLimitConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = config::Config::from_env()?;

    // Initialize tracing, logs and metrics; keep the guard alive until exit
    let (_otel_guard, _meter_provider) = observability::init(&config.observability)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.environment,
        "Starting Switchboard Server"
    );

    // Connect Postgres and Redis and build the store backends
    let backends = api::Backends::connect(&config, RateLimitConfig::from_env()).await?;
    if let Some(stores) = &backends.stores {
        observability::metrics::register_db_pool_metrics(stores.db.clone());
    }

    // Build application state
    let state = api::AppState::new(config.clone(), &backends)?;
    let hub = state.hub.clone();

    // Background tasks
    let shutdown = CancellationToken::new();
    let sweep = idempotency::spawn_retention_sweep(
        backends.ledger.clone(),
        backends.leases.clone(),
        config.idempotency.clone(),
        shutdown.clone(),
    );
    let relay = backends.spawn_relay(&config, hub.clone(), shutdown.clone());

    // Build router
    let app = api::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Server listening");

    // Graceful shutdown handler
    let shutdown_signal = {
        let shutdown = shutdown.clone();
        let hub = hub.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for CTRL+C, shutting down");
            }
            info!("Received shutdown signal, cleaning up...");
            shutdown.cancel();
            hub.close_all(CloseReason::Shutdown);
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    shutdown.cancel();
    sweep.abort();
    relay.abort();

    if let Some(stores) = &backends.stores {
        stores.db.close().await;
        let _ = stores.redis.quit().await;
    }

    info!("Server shutdown complete");

    Ok(())
}

//! Store backends behind the coordination components.
//!
//! Production wires Postgres and Redis; tests and single-process development
//! use the in-memory backends, which are refused when `APP_ENV=production`.

use std::sync::Arc;

use anyhow::{bail, Result};
use fred::prelude::Client;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::events::{EventTransport, LocalTransport, RedisTransport};
use crate::hub::{
    spawn_local_relay, spawn_redis_relay, AccessDirectory, PgAccessDirectory,
    StaticAccessDirectory, SubscriptionHub,
};
use crate::idempotency::{
    IdempotencyLedger, MemoryLedger, MemoryResponseCache, PgLedger, RedisResponseCache,
    ResponseCache,
};
use crate::lease::{LeaseManager, MemoryLeaseStore, RedisLeaseStore};
use crate::ratelimit::{MemoryWindowStore, RateLimitConfig, RateLimiter, RedisWindowStore};

/// Where the hub relay reads bus messages from.
#[derive(Clone)]
pub enum BusSource {
    Redis(Client),
    Local(LocalTransport),
}

/// Connected shared stores, kept for health checks and shutdown.
#[derive(Clone)]
pub struct Stores {
    pub db: PgPool,
    pub redis: Client,
}

/// Every coordination backend the server needs.
#[derive(Clone)]
pub struct Backends {
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub leases: LeaseManager,
    pub rate_limiter: RateLimiter,
    pub responses: Arc<dyn ResponseCache>,
    pub transport: Arc<dyn EventTransport>,
    pub directory: Arc<dyn AccessDirectory>,
    pub bus_source: BusSource,
    pub stores: Option<Stores>,
}

impl Backends {
    /// Connect Postgres and Redis and build the production backends.
    pub async fn connect(config: &Config, rate_limits: RateLimitConfig) -> Result<Self> {
        let db = db::create_pool(&config.database_url, config.store_timeout).await?;
        db::run_migrations(&db).await?;
        let redis = db::create_redis_client(&config.redis_url).await?;

        let window_store = RedisWindowStore::new(redis.clone(), config.store_timeout);
        if rate_limits.enabled {
            // Loading is retried on NOSCRIPT, so a failure here is not fatal.
            if let Err(e) = window_store.init().await {
                warn!(error = %e, "Rate limit script not preloaded");
            }
        } else {
            info!("Rate limiting disabled by configuration");
        }

        let transport = RedisTransport::new(redis.clone(), config.redis_prefix.clone(), config.store_timeout);

        Ok(Self {
            ledger: Arc::new(PgLedger::new(db.clone(), config.store_timeout)),
            leases: LeaseManager::new(
                Arc::new(RedisLeaseStore::new(redis.clone(), config.store_timeout)),
                config.redis_prefix.clone(),
                config.lease.clone(),
            ),
            rate_limiter: RateLimiter::new(Arc::new(window_store), rate_limits),
            responses: Arc::new(RedisResponseCache::new(
                redis.clone(),
                config.redis_prefix.clone(),
                config.store_timeout,
            )),
            transport: Arc::new(transport),
            directory: Arc::new(PgAccessDirectory::new(db.clone(), config.store_timeout)),
            bus_source: BusSource::Redis(redis.clone()),
            stores: Some(Stores { db, redis }),
        })
    }

    /// Process-local backends. The directory starts empty; fill it through
    /// the returned [`StaticAccessDirectory`].
    pub fn in_memory(
        config: &Config,
        rate_limits: RateLimitConfig,
    ) -> Result<(Self, Arc<StaticAccessDirectory>)> {
        if config.environment.is_production() {
            bail!("in-memory backends cannot be used in production");
        }

        let transport = LocalTransport::new();
        let directory = Arc::new(StaticAccessDirectory::new());
        let backends = Self {
            ledger: Arc::new(MemoryLedger::new()),
            leases: LeaseManager::new(
                Arc::new(MemoryLeaseStore::new()),
                config.redis_prefix.clone(),
                config.lease.clone(),
            ),
            rate_limiter: RateLimiter::new(Arc::new(MemoryWindowStore::new()), rate_limits),
            responses: Arc::new(MemoryResponseCache::new()),
            transport: Arc::new(transport.clone()),
            directory: Arc::clone(&directory) as Arc<dyn AccessDirectory>,
            bus_source: BusSource::Local(transport),
            stores: None,
        };
        Ok((backends, directory))
    }

    /// Start the relay feeding bus messages into `hub`.
    pub fn spawn_relay(
        &self,
        config: &Config,
        hub: SubscriptionHub,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        match &self.bus_source {
            BusSource::Redis(redis) => {
                spawn_redis_relay(redis.clone(), config.redis_prefix.clone(), hub, shutdown)
            }
            BusSource::Local(transport) => spawn_local_relay(transport, hub, shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    #[test]
    fn in_memory_is_refused_in_production() {
        let mut config = Config::default_for_test();
        config.environment = Environment::Production;
        assert!(Backends::in_memory(&config, RateLimitConfig::for_test()).is_err());

        config.environment = Environment::Development;
        assert!(Backends::in_memory(&config, RateLimitConfig::for_test()).is_ok());
    }
}

//! Database Layer
//!
//! `PostgreSQL` pool for the idempotency ledger and lead lookups, and the
//! shared Redis client used for leases, rate limiting and the event bus.
//!
//! Redis key namespace (all under `REDIS_PREFIX`):
//! - `{prefix}:lease:{tenant}:{key}`: distributed leases
//! - `{prefix}:rl:{category}:{identifier}`: sliding-window rate limits
//! - `{prefix}:bus:{channel}`: pub/sub event channels
//! - `{prefix}:idem:{scope}:{key}`: cached publish responses

use std::time::Duration;

use anyhow::Result;
use fred::prelude::*;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Create `PostgreSQL` connection pool.
pub async fn create_pool(database_url: &str, acquire_timeout: Duration) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(2)
        .max_connections(20)
        // Ledger calls must fail fast when the pool is exhausted
        .acquire_timeout(acquire_timeout)
        .idle_timeout(Duration::from_secs(600))
        .test_before_acquire(true)
        .connect(database_url)
        .await?;

    info!("Connected to PostgreSQL");
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations completed");
    Ok(())
}

/// Reconnect backoff for Redis clients: unlimited attempts, 100 ms doubling
/// up to 10 s.
fn reconnect_policy() -> ReconnectPolicy {
    ReconnectPolicy::new_exponential(0, 100, 10_000, 2)
}

/// Create and connect the shared Redis client.
///
/// Clients derived with `clone_new` (the relay subscriber) inherit the
/// reconnect policy.
pub async fn create_redis_client(redis_url: &str) -> Result<Client> {
    let config = Config::from_url(redis_url)?;
    let client = Client::new(config, None, None, Some(reconnect_policy()));
    client.connect();
    client.wait_for_connect().await?;

    info!("Connected to Redis");
    Ok(client)
}

/// Check both stores, used by the health endpoint.
pub async fn ping(pool: &PgPool, redis: &Client) -> (bool, bool) {
    let pg = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .is_ok();
    (pg, redis.is_connected())
}

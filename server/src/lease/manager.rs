//! Lease acquisition with bounded exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use super::store::LeaseStore;
use crate::config::LeaseConfig;
use crate::observability::metrics;

/// A held lease. The token is the only proof of ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource: String,
    pub tenant_id: Uuid,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
}

/// Mutual exclusion over `(resource, tenant)` pairs across workers.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    prefix: String,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, prefix: impl Into<String>, config: LeaseConfig) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            config,
        }
    }

    /// Store key for a resource within a tenant.
    #[must_use]
    pub fn key(&self, resource: &str, tenant_id: Uuid) -> String {
        format!("{}:lease:{}:{}", self.prefix, tenant_id, resource)
    }

    /// Acquire a lease, retrying with backoff while it is held elsewhere.
    ///
    /// `None` means contention persisted past the retry budget or the store
    /// is unavailable; the caller must not proceed as the owner.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn acquire(&self, resource: &str, tenant_id: Uuid, ttl: Duration) -> Option<Lease> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 0..attempts {
            match self.attempt(resource, tenant_id, ttl).await {
                Attempt::Acquired(lease) => return Some(lease),
                Attempt::Unavailable => return None,
                Attempt::Held => {
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }
        debug!(resource, attempts, "Lease contention, giving up");
        metrics::record_lease_outcome("contended");
        None
    }

    /// Single acquisition attempt without retries.
    pub async fn try_acquire_once(
        &self,
        resource: &str,
        tenant_id: Uuid,
        ttl: Duration,
    ) -> Option<Lease> {
        match self.attempt(resource, tenant_id, ttl).await {
            Attempt::Acquired(lease) => Some(lease),
            Attempt::Held => {
                metrics::record_lease_outcome("contended");
                None
            }
            Attempt::Unavailable => None,
        }
    }

    /// Release a lease. Stale or mismatched tokens are a no-op returning `false`.
    #[tracing::instrument(skip(self, token), fields(tenant_id = %tenant_id))]
    pub async fn release(&self, resource: &str, tenant_id: Uuid, token: &str) -> bool {
        let key = self.key(resource, tenant_id);
        match self.store.release(&key, token).await {
            Ok(true) => {
                metrics::record_lease_outcome("released");
                true
            }
            Ok(false) => {
                debug!(resource, "Release with stale token ignored");
                metrics::record_lease_outcome("stale");
                false
            }
            Err(e) => {
                warn!(resource, error = %e, "Lease release failed; lease will expire at its TTL");
                metrics::record_lease_outcome("unavailable");
                false
            }
        }
    }

    /// Reset a held lease's TTL. Stale or mismatched tokens return `false`.
    #[tracing::instrument(skip(self, token), fields(tenant_id = %tenant_id))]
    pub async fn extend(&self, resource: &str, tenant_id: Uuid, token: &str, ttl: Duration) -> bool {
        let key = self.key(resource, tenant_id);
        match self.store.extend(&key, token, ttl).await {
            Ok(extended) => {
                if !extended {
                    metrics::record_lease_outcome("stale");
                }
                extended
            }
            Err(e) => {
                warn!(resource, error = %e, "Lease extend failed");
                metrics::record_lease_outcome("unavailable");
                false
            }
        }
    }

    async fn attempt(&self, resource: &str, tenant_id: Uuid, ttl: Duration) -> Attempt {
        let key = self.key(resource, tenant_id);
        let token = Uuid::new_v4().to_string();
        match self.store.try_acquire(&key, &token, ttl).await {
            Ok(true) => {
                metrics::record_lease_outcome("acquired");
                Attempt::Acquired(Lease {
                    resource: resource.to_string(),
                    tenant_id,
                    token,
                    acquired_at: Utc::now(),
                    ttl,
                })
            }
            Ok(false) => Attempt::Held,
            Err(e) => {
                warn!(resource, error = %e, "Lease store unavailable, not granting lease");
                metrics::record_lease_outcome("unavailable");
                Attempt::Unavailable
            }
        }
    }

    /// Exponential backoff capped at `max_backoff`, plus up to 50% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.config.max_backoff);
        let jitter_ms = (base.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }
}

enum Attempt {
    Acquired(Lease),
    Held,
    Unavailable,
}

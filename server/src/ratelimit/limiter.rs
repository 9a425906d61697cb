//! Core rate limiter service.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::observability::metrics;
use crate::ratelimit::{
    LimitConfig, RateLimitCategory, RateLimitConfig, RateLimitError, RateLimitResult,
    WindowStore, MIN_RETRY_AFTER_SECS, REDIS_KEY_CAPACITY,
};
use crate::util::unix_millis;

/// Sliding-window rate limiter over a shared [`WindowStore`].
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    config: Arc<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    /// Checks and records a request for a category and identifier.
    ///
    /// Returns `allowed: false` with retry information if the limit is exceeded.
    ///
    /// # Errors
    /// Returns `RateLimitError::StoreUnavailable` if the store is unreachable.
    #[tracing::instrument(skip(self), fields(category = %category.as_str()))]
    pub async fn check(
        &self,
        category: RateLimitCategory,
        identifier: &str,
    ) -> Result<RateLimitResult, RateLimitError> {
        self.check_at(category, identifier, unix_millis()).await
    }

    /// [`check`](Self::check) with an explicit clock.
    pub async fn check_at(
        &self,
        category: RateLimitCategory,
        identifier: &str,
        now_ms: i64,
    ) -> Result<RateLimitResult, RateLimitError> {
        if !self.config.enabled {
            return Ok(RateLimitResult::unlimited());
        }
        let limit = *self.config.limits.get(category);
        let key = self.build_key(category.as_str(), identifier);
        self.check_window(&key, limit, now_ms).await
    }

    /// Evaluate one sliding window: prune, count, admit if `count < limit`.
    pub async fn check_window(
        &self,
        key: &str,
        limit: LimitConfig,
        now_ms: i64,
    ) -> Result<RateLimitResult, RateLimitError> {
        let member = format!("{now_ms}-{}", Uuid::new_v4().simple());
        let hit = self
            .store
            .hit(key, limit.requests, limit.window(), now_ms, &member)
            .await?;

        Ok(RateLimitResult {
            allowed: hit.allowed,
            limit: limit.requests,
            remaining: if hit.allowed {
                limit.requests.saturating_sub(hit.count)
            } else {
                0
            },
            retry_after: if hit.allowed {
                0
            } else {
                hit.retry_after_ms.div_ceil(1000).max(MIN_RETRY_AFTER_SECS)
            },
        })
    }

    /// Admit a request or explain why not, applying the fail-open policy.
    ///
    /// A store outage admits when `fail_open` is set and otherwise yields
    /// `StoreUnavailable`.
    pub async fn admit(
        &self,
        category: RateLimitCategory,
        identifier: &str,
    ) -> Result<RateLimitResult, RateLimitError> {
        match self.check(category, identifier).await {
            Ok(result) if result.allowed => {
                metrics::record_rate_limit_decision(category.as_str(), "allowed");
                Ok(result)
            }
            Ok(result) => {
                debug!(
                    category = %category.as_str(),
                    identifier,
                    retry_after = result.retry_after,
                    "Rate limit exceeded"
                );
                metrics::record_rate_limit_decision(category.as_str(), "denied");
                Err(RateLimitError::LimitExceeded(result))
            }
            Err(RateLimitError::StoreUnavailable(reason)) if self.config.fail_open => {
                warn!(
                    category = %category.as_str(),
                    identifier,
                    reason = %reason,
                    "Rate limit store unavailable, allowing request (fail_open=true)"
                );
                metrics::record_rate_limit_decision(category.as_str(), "fail_open");
                Ok(RateLimitResult::unlimited())
            }
            Err(e) => {
                metrics::record_rate_limit_decision(category.as_str(), "unavailable");
                Err(e)
            }
        }
    }

    /// Admit only if every `(category, identifier)` pair admits.
    ///
    /// Each level is evaluated independently; the first denial wins.
    pub async fn admit_all(
        &self,
        checks: &[(RateLimitCategory, &str)],
    ) -> Result<(), RateLimitError> {
        for (category, identifier) in checks {
            self.admit(*category, identifier).await?;
        }
        Ok(())
    }

    /// Returns the configuration for this rate limiter.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Builds a Redis key with the configured prefix.
    fn build_key(&self, category: &str, identifier: &str) -> String {
        let mut key = String::with_capacity(REDIS_KEY_CAPACITY);
        key.push_str(&self.config.redis_key_prefix);
        key.push(':');
        key.push_str(category);
        key.push(':');
        key.push_str(identifier);
        key
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::ratelimit::{MemoryWindowStore, WindowHit};

    struct DownStore;

    #[async_trait]
    impl WindowStore for DownStore {
        async fn hit(
            &self,
            _key: &str,
            _limit: u32,
            _window: Duration,
            _now_ms: i64,
            _member: &str,
        ) -> Result<WindowHit, RateLimitError> {
            Err(RateLimitError::StoreUnavailable("connection refused".into()))
        }
    }

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryWindowStore::new()), config)
    }

    #[test]
    fn test_build_key() {
        let limiter = limiter(RateLimitConfig::for_test());
        let key = limiter.build_key("publish_user", "u1");
        assert_eq!(key, "sbtest:rl:publish_user:u1");
    }

    #[tokio::test]
    async fn sixty_per_minute_admits_sixtieth_denies_sixty_first() {
        let limiter = limiter(RateLimitConfig::default());
        let limit = LimitConfig { requests: 60, window_secs: 60 };
        let start = 1_000_000;

        for i in 0..60 {
            let r = limiter.check_window("w", limit, start + i * 100).await.unwrap();
            assert!(r.allowed, "request {} should be admitted", i + 1);
        }
        let denied = limiter.check_window("w", limit, start + 6_000).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after > 0);
        assert_eq!(denied.retry_after, 54);

        // The oldest entry leaves the window after 60s.
        let later = limiter.check_window("w", limit, start + 60_000).await.unwrap();
        assert!(later.allowed);
    }

    #[tokio::test]
    async fn retry_after_is_at_least_one_second() {
        let limiter = limiter(RateLimitConfig::default());
        let limit = LimitConfig { requests: 1, window_secs: 1 };
        limiter.check_window("w", limit, 0).await.unwrap();
        let denied = limiter.check_window("w", limit, 999).await.unwrap();
        assert_eq!(denied.retry_after, 1);
    }

    #[tokio::test]
    async fn disabled_limiter_admits_everything() {
        let mut config = RateLimitConfig::for_test();
        config.enabled = false;
        config.limits.publish_user = LimitConfig { requests: 0, window_secs: 60 };
        let limiter = limiter(config);
        assert!(limiter.admit(RateLimitCategory::PublishUser, "u").await.is_ok());
    }

    #[tokio::test]
    async fn user_and_tenant_levels_are_independent() {
        let mut config = RateLimitConfig::for_test();
        config.limits.publish_user = LimitConfig { requests: 2, window_secs: 60 };
        config.limits.publish_tenant = LimitConfig { requests: 3, window_secs: 60 };
        let limiter = limiter(config);

        let checks = |user| [(RateLimitCategory::PublishUser, user), (RateLimitCategory::PublishTenant, "t1")];

        assert!(limiter.admit_all(&checks("alice")).await.is_ok());
        assert!(limiter.admit_all(&checks("alice")).await.is_ok());
        // Alice is over her own limit.
        assert!(matches!(
            limiter.admit_all(&checks("alice")).await,
            Err(RateLimitError::LimitExceeded(_))
        ));
        // Bob passes his user limit; the tenant has one slot left.
        assert!(limiter.admit_all(&checks("bob")).await.is_ok());
        assert!(matches!(
            limiter.admit_all(&checks("bob")).await,
            Err(RateLimitError::LimitExceeded(_))
        ));
    }

    #[tokio::test]
    async fn outage_follows_fail_open_flag() {
        let open = RateLimiter::new(Arc::new(DownStore), RateLimitConfig::for_test());
        assert!(open.admit(RateLimitCategory::WebhookTenant, "t").await.is_ok());

        let mut config = RateLimitConfig::for_test();
        config.fail_open = false;
        let closed = RateLimiter::new(Arc::new(DownStore), config);
        assert!(matches!(
            closed.admit(RateLimitCategory::WebhookTenant, "t").await,
            Err(RateLimitError::StoreUnavailable(_))
        ));
    }
}

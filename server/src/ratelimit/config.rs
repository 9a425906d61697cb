//! Rate limiting configuration.

use std::time::Duration;

use super::RateLimitCategory;

/// Configuration for the rate limiting system.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    pub enabled: bool,
    /// Prefix for Redis keys (e.g., "sb:rl")
    pub redis_key_prefix: String,
    /// Whether to allow requests when the window store is unavailable
    pub fail_open: bool,
    /// Per-category rate limits
    pub limits: RateLimits,
}

/// Rate limits for each category.
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub webhook_tenant: LimitConfig,
    pub publish_user: LimitConfig,
    pub publish_tenant: LimitConfig,
    pub outbound_tenant: LimitConfig,
    pub ws_connect: LimitConfig,
}

/// Configuration for a single rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    /// Maximum requests allowed in the window
    pub requests: u32,
    /// Window duration in seconds
    pub window_secs: u64,
}

impl LimitConfig {
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_key_prefix: "sb:rl".to_string(),
            fail_open: true,
            limits: RateLimits::default(),
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            webhook_tenant: LimitConfig { requests: 600, window_secs: 60 },
            publish_user: LimitConfig { requests: 60, window_secs: 60 },
            publish_tenant: LimitConfig { requests: 600, window_secs: 60 },
            outbound_tenant: LimitConfig { requests: 120, window_secs: 60 },
            ws_connect: LimitConfig { requests: 10, window_secs: 60 },
        }
    }
}

impl RateLimits {
    /// Returns the limit configuration for a given category.
    pub const fn get(&self, category: RateLimitCategory) -> &LimitConfig {
        match category {
            RateLimitCategory::WebhookTenant => &self.webhook_tenant,
            RateLimitCategory::PublishUser => &self.publish_user,
            RateLimitCategory::PublishTenant => &self.publish_tenant,
            RateLimitCategory::OutboundTenant => &self.outbound_tenant,
            RateLimitCategory::WsConnect => &self.ws_connect,
        }
    }

    fn get_mut(&mut self, category: RateLimitCategory) -> &mut LimitConfig {
        match category {
            RateLimitCategory::WebhookTenant => &mut self.webhook_tenant,
            RateLimitCategory::PublishUser => &mut self.publish_user,
            RateLimitCategory::PublishTenant => &mut self.publish_tenant,
            RateLimitCategory::OutboundTenant => &mut self.outbound_tenant,
            RateLimitCategory::WsConnect => &mut self.ws_connect,
        }
    }
}

impl RateLimitConfig {
    /// Creates configuration from environment variables.
    ///
    /// Environment variables:
    /// - `RATE_LIMIT_ENABLED`: Enable/disable rate limiting (default: true)
    /// - `RATE_LIMIT_PREFIX`: Redis key prefix (default: "`{REDIS_PREFIX}`:rl")
    /// - `RATE_LIMIT_FAIL_OPEN`: Allow requests when Redis unavailable (default: true)
    /// - `RATE_LIMIT_WEBHOOK_TENANT`: Webhook deliveries per tenant as "requests,window_secs"
    /// - `RATE_LIMIT_PUBLISH_USER`: Publish calls per user as "requests,window_secs"
    /// - `RATE_LIMIT_PUBLISH_TENANT`: Publish calls per tenant as "requests,window_secs"
    /// - `RATE_LIMIT_OUTBOUND_TENANT`: Downstream calls per tenant as "requests,window_secs"
    /// - `RATE_LIMIT_WS_CONNECT`: WebSocket connects per user as "requests,window_secs"
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("RATE_LIMIT_ENABLED") {
            config.enabled = val.parse().unwrap_or(true);
        }
        config.redis_key_prefix = std::env::var("RATE_LIMIT_PREFIX").unwrap_or_else(|_| {
            let base = std::env::var("REDIS_PREFIX").unwrap_or_else(|_| "sb".into());
            format!("{base}:rl")
        });
        if let Ok(val) = std::env::var("RATE_LIMIT_FAIL_OPEN") {
            config.fail_open = val.parse().unwrap_or(true);
        }

        for &category in RateLimitCategory::all() {
            let var = format!("RATE_LIMIT_{}", category.as_str().to_ascii_uppercase());
            if let Ok(val) = std::env::var(&var) {
                match parse_limit_config(&val) {
                    Some(limit) => *config.limits.get_mut(category) = limit,
                    None => tracing::warn!(var, value = %val, "Ignoring malformed rate limit"),
                }
            }
        }

        config
    }

    /// Configuration for tests: small limits, no fail-open surprises.
    pub fn for_test() -> Self {
        Self {
            enabled: true,
            redis_key_prefix: "sbtest:rl".to_string(),
            fail_open: true,
            limits: RateLimits {
                webhook_tenant: LimitConfig { requests: 100, window_secs: 60 },
                publish_user: LimitConfig { requests: 10, window_secs: 60 },
                publish_tenant: LimitConfig { requests: 100, window_secs: 60 },
                outbound_tenant: LimitConfig { requests: 100, window_secs: 60 },
                ws_connect: LimitConfig { requests: 10, window_secs: 60 },
            },
        }
    }
}

/// Parses a limit config from "requests,window_secs" format.
fn parse_limit_config(val: &str) -> Option<LimitConfig> {
    let parts: Vec<&str> = val.split(',').collect();
    if parts.len() == 2 {
        let requests = parts[0].trim().parse().ok()?;
        let window_secs = parts[1].trim().parse().ok()?;
        if window_secs == 0 {
            return None;
        }
        Some(LimitConfig { requests, window_secs })
    } else {
        None
    }
}

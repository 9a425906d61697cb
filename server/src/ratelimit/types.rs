//! Rate limiting types.

/// Categories for rate limiting with different thresholds.
///
/// Each category is keyed by one scope: a tenant id or a user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitCategory {
    /// Inbound webhook deliveries per tenant
    WebhookTenant,
    /// Publish API calls per user
    PublishUser,
    /// Publish API calls per tenant
    PublishTenant,
    /// Calls to the downstream analysis service per tenant
    OutboundTenant,
    /// WebSocket connection attempts per user
    WsConnect,
}

impl RateLimitCategory {
    /// Returns the string identifier for this category (used in Redis keys).
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WebhookTenant => "webhook_tenant",
            Self::PublishUser => "publish_user",
            Self::PublishTenant => "publish_tenant",
            Self::OutboundTenant => "outbound_tenant",
            Self::WsConnect => "ws_connect",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::WebhookTenant,
            Self::PublishUser,
            Self::PublishTenant,
            Self::OutboundTenant,
            Self::WsConnect,
        ]
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Maximum requests allowed in the window
    pub limit: u32,
    /// Remaining requests in the current window
    pub remaining: u32,
    /// Seconds to wait before retrying (0 if allowed)
    pub retry_after: u64,
}

impl RateLimitResult {
    /// Result for a check that was skipped (disabled or failed open).
    pub const fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            retry_after: 0,
        }
    }
}

/// Raw outcome of one sliding-window evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Entries in the window after this evaluation
    pub count: u32,
    pub allowed: bool,
    /// Milliseconds until the oldest entry leaves the window (0 if allowed)
    pub retry_after_ms: u64,
}

//! Rate limiting constants.

/// Redis key pre-allocation size
pub const REDIS_KEY_CAPACITY: usize = 64;

/// Lua script return codes
pub const SCRIPT_ALLOWED: i64 = 1;

/// Smallest `Retry-After` ever reported to a denied caller.
pub const MIN_RETRY_AFTER_SECS: u64 = 1;

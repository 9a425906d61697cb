//! Redis lease store: `SET NX PX` to acquire, Lua compare-and-act to release
//! and extend.

use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use fred::types::{Expiration, SetOptions};

use super::error::LeaseError;
use super::store::LeaseStore;
use crate::util::{duration_millis, with_timeout};

/// Delete the key only if it still holds the caller's token.
const RELEASE_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Reset the expiry only if the key still holds the caller's token.
const EXTEND_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

/// Lease store shared by every worker through Redis.
#[derive(Clone)]
pub struct RedisLeaseStore {
    redis: Client,
    timeout: Duration,
}

impl RedisLeaseStore {
    #[must_use]
    pub const fn new(redis: Client, timeout: Duration) -> Self {
        Self { redis, timeout }
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let ttl_ms = duration_millis(ttl).max(1);
        let set = async {
            let reply: Option<String> = self
                .redis
                .set(
                    key,
                    token,
                    Some(Expiration::PX(ttl_ms)),
                    Some(SetOptions::NX),
                    false,
                )
                .await?;
            Ok(reply.is_some())
        };
        with_timeout(self.timeout, set, || LeaseError::Timeout).await
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LeaseError> {
        let eval = async {
            let deleted: i64 = self.redis.eval(RELEASE_LUA, vec![key], vec![token]).await?;
            Ok(deleted == 1)
        };
        with_timeout(self.timeout, eval, || LeaseError::Timeout).await
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let ttl_ms = duration_millis(ttl).max(1).to_string();
        let eval = async {
            let extended: i64 = self
                .redis
                .eval(EXTEND_LUA, vec![key], vec![token, ttl_ms.as_str()])
                .await?;
            Ok(extended == 1)
        };
        with_timeout(self.timeout, eval, || LeaseError::Timeout).await
    }
}

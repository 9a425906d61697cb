//! `Idempotency-Key` response cache for mutating REST calls.
//!
//! The first request with a key reserves it with an in-progress marker that
//! lives only as long as one request may run. A repeat while that request
//! runs sees [`Reservation::InProgress`]; a repeat after it finished replays
//! the stored status and body, kept for the longer response TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use fred::types::{Expiration, SetOptions};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::error::IdempotencyError;
use crate::util::{duration_millis, with_timeout};

/// Longest accepted `Idempotency-Key` header value.
pub const MAX_KEY_LEN: usize = 255;

/// A completed response kept for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

/// Result of reserving a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The caller owns the key and must complete or abandon it.
    Reserved,
    /// Another request with this key is still running.
    InProgress,
    /// The original request finished; replay its response.
    Completed(StoredResponse),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum Entry {
    Pending,
    Done(StoredResponse),
}

/// Check an `Idempotency-Key` header value: 1..=255 visible ASCII characters.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LEN && key.bytes().all(|b| b.is_ascii_graphic())
}

/// Response cache keyed by `(scope, key)`; scope is tenant plus operation.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Reserve `key`. An unfinished reservation lapses after `pending_ttl`.
    async fn reserve(&self, scope: &str, key: &str, pending_ttl: Duration)
        -> Result<Reservation, IdempotencyError>;

    /// Store the finished response for `ttl`, replacing the marker.
    async fn complete(
        &self,
        scope: &str,
        key: &str,
        response: &StoredResponse,
        ttl: Duration,
    ) -> Result<(), IdempotencyError>;

    /// Drop the in-progress marker so the client can retry.
    async fn abandon(&self, scope: &str, key: &str) -> Result<(), IdempotencyError>;
}

/// Redis-backed response cache shared by every instance.
#[derive(Clone)]
pub struct RedisResponseCache {
    redis: Client,
    prefix: String,
    timeout: Duration,
}

impl RedisResponseCache {
    pub fn new(redis: Client, prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            timeout,
        }
    }

    fn build_key(&self, scope: &str, key: &str) -> String {
        format!("{}:idem:{}:{}", self.prefix, scope, key)
    }

    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, IdempotencyError> {
        let marker = serde_json::to_string(&Entry::Pending)
            .map_err(|e| IdempotencyError::StoreUnavailable(e.to_string()))?;
        let reply: Option<String> = self
            .redis
            .set(
                key,
                marker,
                Some(Expiration::PX(duration_millis(ttl).max(1))),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl ResponseCache for RedisResponseCache {
    async fn reserve(
        &self,
        scope: &str,
        key: &str,
        pending_ttl: Duration,
    ) -> Result<Reservation, IdempotencyError> {
        let redis_key = self.build_key(scope, key);
        let op = async {
            // Two rounds cover the key expiring between SET NX and GET.
            for _ in 0..2 {
                if self.set_nx(&redis_key, pending_ttl).await? {
                    return Ok(Reservation::Reserved);
                }
                let existing: Option<String> = self.redis.get(&redis_key).await?;
                match existing.map(|raw| serde_json::from_str::<Entry>(&raw)) {
                    Some(Ok(Entry::Done(response))) => return Ok(Reservation::Completed(response)),
                    Some(Ok(Entry::Pending)) => return Ok(Reservation::InProgress),
                    Some(Err(e)) => {
                        return Err(IdempotencyError::StoreUnavailable(format!(
                            "corrupt cached response: {e}"
                        )))
                    }
                    None => {}
                }
            }
            Ok(Reservation::InProgress)
        };
        with_timeout(self.timeout, op, || IdempotencyError::Timeout).await
    }

    async fn complete(
        &self,
        scope: &str,
        key: &str,
        response: &StoredResponse,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        let redis_key = self.build_key(scope, key);
        let value = serde_json::to_string(&Entry::Done(response.clone()))
            .map_err(|e| IdempotencyError::StoreUnavailable(e.to_string()))?;
        let op = async {
            self.redis
                .set::<(), _, _>(
                    &redis_key,
                    value,
                    Some(Expiration::PX(duration_millis(ttl).max(1))),
                    None,
                    false,
                )
                .await?;
            Ok(())
        };
        with_timeout(self.timeout, op, || IdempotencyError::Timeout).await
    }

    async fn abandon(&self, scope: &str, key: &str) -> Result<(), IdempotencyError> {
        let redis_key = self.build_key(scope, key);
        let op = async {
            self.redis.del::<i64, _>(&redis_key).await?;
            Ok(())
        };
        with_timeout(self.timeout, op, || IdempotencyError::Timeout).await
    }
}

/// Process-local response cache for tests and single-process development.
#[derive(Debug, Default)]
pub struct MemoryResponseCache {
    entries: Mutex<HashMap<String, (Option<StoredResponse>, Instant)>>,
}

impl MemoryResponseCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Option<StoredResponse>, Instant)>> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn reserve(
        &self,
        scope: &str,
        key: &str,
        pending_ttl: Duration,
    ) -> Result<Reservation, IdempotencyError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let id = format!("{scope}:{key}");
        match entries.get(&id) {
            Some((Some(response), expires)) if *expires > now => {
                Ok(Reservation::Completed(response.clone()))
            }
            Some((None, expires)) if *expires > now => Ok(Reservation::InProgress),
            _ => {
                entries.insert(id, (None, now + pending_ttl));
                Ok(Reservation::Reserved)
            }
        }
    }

    async fn complete(
        &self,
        scope: &str,
        key: &str,
        response: &StoredResponse,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        self.lock().insert(
            format!("{scope}:{key}"),
            (Some(response.clone()), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn abandon(&self, scope: &str, key: &str) -> Result<(), IdempotencyError> {
        self.lock().remove(&format!("{scope}:{key}"));
        Ok(())
    }
}

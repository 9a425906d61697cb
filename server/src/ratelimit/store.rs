//! Sliding-window storage backends.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::ratelimit::{RateLimitError, WindowHit, SCRIPT_ALLOWED};
use crate::util::{duration_millis, with_timeout};

/// Embedded Lua script for atomic sliding-window admission.
const RATE_LIMIT_SCRIPT: &str = include_str!("rate_limit.lua");

/// Atomic prune-count-admit over one window key.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Evaluate one request at `now_ms` against `limit` per `window`.
    ///
    /// `member` must be unique per request so simultaneous hits are all counted.
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: i64,
        member: &str,
    ) -> Result<WindowHit, RateLimitError>;
}

/// Window store backed by Redis sorted sets.
#[derive(Clone)]
pub struct RedisWindowStore {
    redis: Client,
    timeout: Duration,
    script_sha: Arc<RwLock<String>>,
}

impl RedisWindowStore {
    /// Creates a new store. Call `init()` to load the Lua script.
    pub fn new(redis: Client, timeout: Duration) -> Self {
        Self {
            redis,
            timeout,
            script_sha: Arc::new(RwLock::new(String::new())),
        }
    }

    /// Loads the Lua script into Redis.
    pub async fn init(&self) -> Result<(), Error> {
        self.load_script().await
    }

    /// Loads or reloads the Lua script; also called on NOSCRIPT errors.
    async fn load_script(&self) -> Result<(), Error> {
        let sha: String = self.redis.script_load(RATE_LIMIT_SCRIPT).await?;
        info!(rate_limit_sha = %sha, "Lua script loaded into Redis");
        *self.script_sha.write().await = sha;
        Ok(())
    }

    /// Checks if an error is a NOSCRIPT error (script not found in Redis).
    fn is_noscript_error(error: &Error) -> bool {
        error.to_string().contains("NOSCRIPT")
    }

    async fn evalsha(&self, key: &str, args: &[String]) -> Result<Vec<i64>, Error> {
        let sha = self.script_sha.read().await.clone();
        self.redis.evalsha(&sha, vec![key], args.to_vec()).await
    }

    /// Executes the rate limit script with NOSCRIPT retry.
    async fn execute(&self, key: &str, args: Vec<String>) -> Result<Vec<i64>, RateLimitError> {
        match self.evalsha(key, &args).await {
            Ok(r) => Ok(r),
            Err(e) if Self::is_noscript_error(&e) => {
                warn!("NOSCRIPT error, reloading Lua script");
                self.load_script().await?;
                Ok(self.evalsha(key, &args).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: i64,
        member: &str,
    ) -> Result<WindowHit, RateLimitError> {
        let args = vec![
            now_ms.to_string(),
            duration_millis(window).to_string(),
            limit.to_string(),
            member.to_string(),
        ];
        let reply = with_timeout(self.timeout, self.execute(key, args), || {
            RateLimitError::StoreUnavailable("timed out".into())
        })
        .await?;

        match reply.as_slice() {
            [count, allowed, retry_ms] => Ok(WindowHit {
                count: (*count).max(0) as u32,
                allowed: *allowed == SCRIPT_ALLOWED,
                retry_after_ms: (*retry_ms).max(0) as u64,
            }),
            other => Err(RateLimitError::StoreUnavailable(format!(
                "unexpected script reply {other:?}"
            ))),
        }
    }
}

/// Process-local window store for tests and single-process development.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    windows: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: i64,
        _member: &str,
    ) -> Result<WindowHit, RateLimitError> {
        let window_ms = duration_millis(window);
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entries = windows.entry(key.to_string()).or_default();

        while entries.front().is_some_and(|&t| t <= now_ms - window_ms) {
            entries.pop_front();
        }

        let count = entries.len() as u32;
        if count < limit {
            entries.push_back(now_ms);
            return Ok(WindowHit {
                count: count + 1,
                allowed: true,
                retry_after_ms: 0,
            });
        }

        let retry = entries
            .front()
            .map_or(window_ms, |&oldest| oldest + window_ms - now_ms)
            .max(1);
        Ok(WindowHit {
            count,
            allowed: false,
            retry_after_ms: retry as u64,
        })
    }
}

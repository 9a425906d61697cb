//! Lease storage backends.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::error::LeaseError;

/// Atomic set-if-absent and compare-and-act over lease keys.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Store `token` under `key` only if no live lease exists.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LeaseError>;

    /// Delete `key` only if it still holds `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool, LeaseError>;

    /// Reset the expiry of `key` only if it still holds `token`.
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LeaseError>;
}

/// Process-local lease store for tests and single-process development.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLeaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token currently holding `key`, if the lease is live.
    #[must_use]
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(token, _)| token.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.leases.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let now = Instant::now();
        let mut leases = self.lock();
        if leases.get(key).is_some_and(|(_, expires)| *expires > now) {
            return Ok(false);
        }
        leases.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LeaseError> {
        let now = Instant::now();
        let mut leases = self.lock();
        match leases.get(key) {
            Some((held, expires)) if held == token && *expires > now => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let now = Instant::now();
        let mut leases = self.lock();
        match leases.get_mut(key) {
            Some((held, expires)) if held == token && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

//! Exactly-once claim ledger.
//!
//! A delivery is identified by `(tenant_id, provider, external_id)`. The first
//! caller to claim a key runs the handler; everyone else sees a duplicate
//! until the claim is committed (permanent) or released (retryable).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use super::error::IdempotencyError;

/// Tenant-scoped identity of one external delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub tenant_id: Uuid,
    pub provider: String,
    pub external_id: String,
}

impl IdempotencyKey {
    pub fn new(tenant_id: Uuid, provider: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            provider: provider.into(),
            external_id: external_id.into(),
        }
    }
}

/// Proof that the caller holds the in-flight claim on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub key: IdempotencyKey,
    pub token: Uuid,
    /// Deliveries seen for this key so far, including this one.
    pub attempts: i32,
}

/// Result of [`IdempotencyLedger::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the key and must commit or release it.
    Fresh(Claim),
    /// Already committed (`in_flight == false`) or claimed by a live worker.
    Duplicate { in_flight: bool },
}

impl ClaimOutcome {
    /// Label used for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh(_) => "fresh",
            Self::Duplicate { in_flight: true } => "in_flight",
            Self::Duplicate { in_flight: false } => "duplicate",
        }
    }
}

/// Durable exactly-once ledger.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Atomically record a delivery and take the claim if nobody holds it.
    ///
    /// The claim lapses after `claim_ttl` so a crashed worker cannot wedge a key.
    async fn claim(
        &self,
        key: &IdempotencyKey,
        claim_ttl: Duration,
    ) -> Result<ClaimOutcome, IdempotencyError>;

    /// Mark the key processed. Returns `false` if it was already committed.
    async fn commit(&self, claim: &Claim) -> Result<bool, IdempotencyError>;

    /// Drop an uncommitted claim so the next delivery retries.
    ///
    /// Returns `false` if the key was committed or the claim changed hands.
    async fn release(&self, claim: &Claim) -> Result<bool, IdempotencyError>;

    /// Delete rows created before `cutoff`. Returns the number removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, IdempotencyError>;
}

/// Releases a claim on drop unless it was disarmed.
///
/// Covers handler panics and request cancellation: the key becomes retryable
/// instead of waiting for the claim TTL.
pub struct ClaimGuard {
    ledger: Arc<dyn IdempotencyLedger>,
    claim: Option<Claim>,
}

impl ClaimGuard {
    pub fn new(ledger: Arc<dyn IdempotencyLedger>, claim: Claim) -> Self {
        Self {
            ledger,
            claim: Some(claim),
        }
    }

    #[must_use]
    pub fn claim(&self) -> Option<&Claim> {
        self.claim.as_ref()
    }

    /// Stop the guard from releasing; the caller settles the claim itself.
    pub fn disarm(mut self) -> Claim {
        self.claim
            .take()
            .unwrap_or_else(|| unreachable!("claim is only taken by disarm or drop"))
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };
        let ledger = Arc::clone(&self.ledger);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = ledger.release(&claim).await {
                        warn!(
                            tenant_id = %claim.key.tenant_id,
                            provider = %claim.key.provider,
                            error = %e,
                            "Failed to release abandoned claim; it will lapse at its TTL"
                        );
                    }
                });
            }
            Err(_) => warn!(
                provider = %claim.key.provider,
                "No runtime to release abandoned claim; it will lapse at its TTL"
            ),
        }
    }
}

#[derive(Debug, Clone)]
struct LedgerRow {
    attempts: i32,
    claim_token: Option<Uuid>,
    claimed_until: Option<DateTime<Utc>>,
    first_processed_at: Option<DateTime<Utc>>,
    last_seen_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

/// Process-local ledger for tests and single-process development.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    rows: Mutex<HashMap<IdempotencyKey, LedgerRow>>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` has been committed.
    #[must_use]
    pub fn is_committed(&self, key: &IdempotencyKey) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|row| row.first_processed_at.is_some())
    }

    /// Deliveries seen for `key`.
    #[must_use]
    pub fn attempts(&self, key: &IdempotencyKey) -> i32 {
        self.lock().get(key).map_or(0, |row| row.attempts)
    }

    /// When `key` was last seen.
    #[must_use]
    pub fn last_seen(&self, key: &IdempotencyKey) -> Option<DateTime<Utc>> {
        self.lock().get(key).map(|row| row.last_seen_at)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Backdate a row's creation time, for retention tests.
    pub fn backdate(&self, key: &IdempotencyKey, created_at: DateTime<Utc>) {
        if let Some(row) = self.lock().get_mut(key) {
            row.created_at = created_at;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IdempotencyKey, LedgerRow>> {
        // A panic while holding the lock leaves rows consistent; keep serving.
        self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl IdempotencyLedger for MemoryLedger {
    async fn claim(
        &self,
        key: &IdempotencyKey,
        claim_ttl: Duration,
    ) -> Result<ClaimOutcome, IdempotencyError> {
        let now = Utc::now();
        let until = chrono::Duration::from_std(claim_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let token = Uuid::new_v4();
        let mut rows = self.lock();

        let Some(row) = rows.get_mut(key) else {
            rows.insert(
                key.clone(),
                LedgerRow {
                    attempts: 1,
                    claim_token: Some(token),
                    claimed_until: Some(until),
                    first_processed_at: None,
                    last_seen_at: now,
                    created_at: now,
                },
            );
            return Ok(ClaimOutcome::Fresh(Claim {
                key: key.clone(),
                token,
                attempts: 1,
            }));
        };

        row.attempts += 1;
        row.last_seen_at = now;

        if row.first_processed_at.is_some() {
            return Ok(ClaimOutcome::Duplicate { in_flight: false });
        }
        if row.claimed_until.is_some_and(|t| t > now) {
            return Ok(ClaimOutcome::Duplicate { in_flight: true });
        }

        row.claim_token = Some(token);
        row.claimed_until = Some(until);
        Ok(ClaimOutcome::Fresh(Claim {
            key: key.clone(),
            token,
            attempts: row.attempts,
        }))
    }

    async fn commit(&self, claim: &Claim) -> Result<bool, IdempotencyError> {
        let mut rows = self.lock();
        match rows.get_mut(&claim.key) {
            Some(row) if row.first_processed_at.is_none() => {
                row.first_processed_at = Some(Utc::now());
                row.claim_token = None;
                row.claimed_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, claim: &Claim) -> Result<bool, IdempotencyError> {
        let mut rows = self.lock();
        match rows.get_mut(&claim.key) {
            Some(row)
                if row.first_processed_at.is_none() && row.claim_token == Some(claim.token) =>
            {
                row.claim_token = None;
                row.claimed_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        let mut rows = self.lock();
        let before = rows.len();
        rows.retain(|_, row| row.created_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}

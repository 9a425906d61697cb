//! Retention sweep for the idempotency ledger.
//!
//! Runs on every instance; the `idempotency:sweep` lease makes sure only one
//! of them purges per interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ledger::IdempotencyLedger;
use crate::config::IdempotencyConfig;
use crate::lease::LeaseManager;

/// Lease resource guarding the sweep. Held under the nil (global) tenant.
pub const SWEEP_LEASE: &str = "idempotency:sweep";

/// Start the periodic retention sweep.
///
/// The first tick is consumed immediately so startup is not slowed by a purge.
pub fn spawn_retention_sweep(
    ledger: Arc<dyn IdempotencyLedger>,
    leases: LeaseManager,
    config: IdempotencyConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.sweep_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    run_sweep_cycle(ledger.as_ref(), &leases, config.retention, config.sweep_interval).await;
                }
            }
        }
        tracing::debug!("Retention sweep stopped");
    })
}

/// Run one sweep if this instance wins the lease.
///
/// Returns the number of rows purged, or `None` when another instance holds
/// the lease or the purge failed.
#[tracing::instrument(skip(ledger, leases))]
pub async fn run_sweep_cycle(
    ledger: &dyn IdempotencyLedger,
    leases: &LeaseManager,
    retention: Duration,
    lease_ttl: Duration,
) -> Option<u64> {
    let Some(lease) = leases.try_acquire_once(SWEEP_LEASE, Uuid::nil(), lease_ttl).await else {
        tracing::debug!("Retention sweep skipped, lease held elsewhere");
        return None;
    };

    let start = Instant::now();
    let cutoff = Utc::now()
        - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(90));

    let purged = match ledger.purge_older_than(cutoff).await {
        Ok(count) => {
            tracing::info!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                purged = count,
                "Idempotency retention sweep completed"
            );
            Some(count)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Idempotency retention sweep failed");
            None
        }
    };

    leases.release(SWEEP_LEASE, Uuid::nil(), &lease.token).await;
    purged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::idempotency::{IdempotencyKey, MemoryLedger};
    use crate::lease::MemoryLeaseStore;

    fn leases(store: Arc<MemoryLeaseStore>) -> LeaseManager {
        LeaseManager::new(store, "sbtest", Config::default_for_test().lease)
    }

    #[tokio::test]
    async fn sweep_purges_expired_rows() {
        let ledger = MemoryLedger::new();
        let key = IdempotencyKey::new(Uuid::new_v4(), "dialer", "old");
        ledger.claim(&key, Duration::from_secs(1)).await.unwrap();
        ledger.backdate(&key, Utc::now() - chrono::Duration::days(100));

        let store = Arc::new(MemoryLeaseStore::new());
        let purged = run_sweep_cycle(
            &ledger,
            &leases(store.clone()),
            Duration::from_secs(90 * 86_400),
            Duration::from_secs(60),
        )
        .await;

        assert_eq!(purged, Some(1));
        assert!(ledger.is_empty());
        // The lease is released after the sweep.
        let key = format!("sbtest:lease:{}:{SWEEP_LEASE}", Uuid::nil());
        assert_eq!(store.holder(&key), None);
    }

    #[tokio::test]
    async fn sweep_skips_when_lease_is_held() {
        let ledger = MemoryLedger::new();
        let store = Arc::new(MemoryLeaseStore::new());
        let manager = leases(store);
        let _held = manager
            .try_acquire_once(SWEEP_LEASE, Uuid::nil(), Duration::from_secs(60))
            .await
            .unwrap();

        let purged = run_sweep_cycle(
            &ledger,
            &manager,
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
        .await;
        assert_eq!(purged, None);
    }
}

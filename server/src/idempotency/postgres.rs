//! `PostgreSQL` ledger backed by the `webhook_idempotency` table.
//!
//! Every operation is a single conditional statement, so a cancelled request
//! never leaves a half-applied claim behind.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::error::IdempotencyError;
use super::ledger::{Claim, ClaimOutcome, IdempotencyKey, IdempotencyLedger};
use crate::util::{duration_millis, with_timeout};

const PURGE_BATCH_SIZE: i64 = 10_000;

/// Ledger stored in `PostgreSQL`, shared by every worker.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
    timeout: Duration,
}

impl PgLedger {
    #[must_use]
    pub const fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl IdempotencyLedger for PgLedger {
    #[tracing::instrument(skip(self), fields(tenant_id = %key.tenant_id, provider = %key.provider))]
    async fn claim(
        &self,
        key: &IdempotencyKey,
        claim_ttl: Duration,
    ) -> Result<ClaimOutcome, IdempotencyError> {
        let token = Uuid::new_v4();
        // Both CASE arms read the pre-update row, so they agree on whether the
        // claim is taken.
        let query = sqlx::query_as::<_, (i32, bool, bool)>(
            r"
            INSERT INTO webhook_idempotency
                (tenant_id, provider, external_id, attempts, claim_token, claimed_until)
            VALUES ($1, $2, $3, 1, $4, NOW() + $5 * INTERVAL '1 millisecond')
            ON CONFLICT (tenant_id, provider, external_id) DO UPDATE SET
                attempts = webhook_idempotency.attempts + 1,
                last_seen_at = NOW(),
                claim_token = CASE
                    WHEN webhook_idempotency.first_processed_at IS NULL
                     AND (webhook_idempotency.claimed_until IS NULL
                          OR webhook_idempotency.claimed_until <= NOW())
                    THEN EXCLUDED.claim_token
                    ELSE webhook_idempotency.claim_token
                END,
                claimed_until = CASE
                    WHEN webhook_idempotency.first_processed_at IS NULL
                     AND (webhook_idempotency.claimed_until IS NULL
                          OR webhook_idempotency.claimed_until <= NOW())
                    THEN EXCLUDED.claimed_until
                    ELSE webhook_idempotency.claimed_until
                END
            RETURNING attempts,
                      first_processed_at IS NOT NULL,
                      COALESCE(claim_token = $4, false)
            ",
        )
        .bind(key.tenant_id)
        .bind(&key.provider)
        .bind(&key.external_id)
        .bind(token)
        .bind(duration_millis(claim_ttl) as f64)
        .fetch_one(&self.pool);

        let (attempts, committed, claimed) =
            with_timeout(self.timeout, async { Ok(query.await?) }, || IdempotencyError::Timeout)
                .await?;

        Ok(if claimed {
            ClaimOutcome::Fresh(Claim {
                key: key.clone(),
                token,
                attempts,
            })
        } else {
            ClaimOutcome::Duplicate {
                in_flight: !committed,
            }
        })
    }

    #[tracing::instrument(skip(self, claim), fields(tenant_id = %claim.key.tenant_id))]
    async fn commit(&self, claim: &Claim) -> Result<bool, IdempotencyError> {
        let query = sqlx::query(
            r"
            UPDATE webhook_idempotency
            SET first_processed_at = NOW(),
                last_seen_at = NOW(),
                claim_token = NULL,
                claimed_until = NULL
            WHERE tenant_id = $1 AND provider = $2 AND external_id = $3
              AND first_processed_at IS NULL
            ",
        )
        .bind(claim.key.tenant_id)
        .bind(&claim.key.provider)
        .bind(&claim.key.external_id)
        .execute(&self.pool);

        let result =
            with_timeout(self.timeout, async { Ok(query.await?) }, || IdempotencyError::Timeout)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, claim), fields(tenant_id = %claim.key.tenant_id))]
    async fn release(&self, claim: &Claim) -> Result<bool, IdempotencyError> {
        let query = sqlx::query(
            r"
            UPDATE webhook_idempotency
            SET claim_token = NULL,
                claimed_until = NULL
            WHERE tenant_id = $1 AND provider = $2 AND external_id = $3
              AND first_processed_at IS NULL
              AND claim_token = $4
            ",
        )
        .bind(claim.key.tenant_id)
        .bind(&claim.key.provider)
        .bind(&claim.key.external_id)
        .bind(claim.token)
        .execute(&self.pool);

        let result =
            with_timeout(self.timeout, async { Ok(query.await?) }, || IdempotencyError::Timeout)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        // Batched so a large backlog never holds row locks for long; each
        // batch gets its own store deadline.
        let mut total = 0;
        loop {
            let query = sqlx::query(
                r"
                DELETE FROM webhook_idempotency WHERE ctid IN (
                    SELECT ctid FROM webhook_idempotency
                    WHERE created_at < $1
                    LIMIT $2
                )
                ",
            )
            .bind(cutoff)
            .bind(PURGE_BATCH_SIZE)
            .execute(&self.pool);

            let result =
                with_timeout(self.timeout, async { Ok(query.await?) }, || IdempotencyError::Timeout)
                    .await?;
            let deleted = result.rows_affected();
            total += deleted;
            if deleted < PURGE_BATCH_SIZE as u64 {
                return Ok(total);
            }
        }
    }
}

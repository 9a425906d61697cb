//! Idempotency store errors.

use thiserror::Error;

/// The ledger could not be reached or answered too slowly.
///
/// Callers must treat this as "do not process": the ledger fails closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdempotencyError {
    #[error("idempotency store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("idempotency store timed out")]
    Timeout,
}

impl From<sqlx::Error> for IdempotencyError {
    fn from(err: sqlx::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<fred::error::Error> for IdempotencyError {
    fn from(err: fred::error::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

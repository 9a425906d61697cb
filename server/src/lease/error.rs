//! Lease errors.

use thiserror::Error;

/// Failures talking to the lease store. Callers never treat these as a grant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("lease store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("lease store timed out")]
    Timeout,
}

impl From<fred::error::Error> for LeaseError {
    fn from(err: fred::error::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

//! Idempotency
//!
//! Exactly-once processing of webhook deliveries, retention of the ledger,
//! and replay of cached responses for `Idempotency-Key` REST calls.

mod error;
mod ledger;
mod postgres;
mod request;
mod sweep;

pub use error::IdempotencyError;
pub use ledger::{Claim, ClaimGuard, ClaimOutcome, IdempotencyKey, IdempotencyLedger, MemoryLedger};
pub use postgres::PgLedger;
pub use request::{
    is_valid_key, MemoryResponseCache, RedisResponseCache, Reservation, ResponseCache,
    StoredResponse, MAX_KEY_LEN,
};
pub use sweep::{run_sweep_cycle, spawn_retention_sweep, SWEEP_LEASE};

//! Distributed Leases
//!
//! Per-tenant mutual exclusion for background work. A lease expires on its
//! own after its TTL; release and extend only act for the token holder.

mod error;
mod manager;
mod redis;
mod store;

pub use error::LeaseError;
pub use manager::{Lease, LeaseManager};
pub use redis::RedisLeaseStore;
pub use store::{LeaseStore, MemoryLeaseStore};

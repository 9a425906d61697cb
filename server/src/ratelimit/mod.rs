//! Rate limiting module for protecting against abuse.
//!
//! Sliding-window limits per user and per tenant for webhook ingestion, the
//! publish API, socket connects, and outbound calls to the analysis service.

pub mod config;
pub mod constants;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod store;
pub mod types;

pub use config::*;
pub use constants::*;
pub use error::*;
pub use limiter::*;
pub use middleware::rate_limit_publish;
pub use store::*;
pub use types::*;

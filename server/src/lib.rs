//! Switchboard Server
//!
//! Multi-tenant webhook ingestion with exactly-once processing, distributed
//! coordination primitives, and real-time event fanout over WebSockets.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod events;
pub mod hub;
pub mod idempotency;
pub mod lease;
pub mod observability;
pub mod ratelimit;
pub mod signature;
pub mod util;
pub mod webhooks;

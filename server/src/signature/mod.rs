//! Webhook Signature Verification
//!
//! Authenticates inbound deliveries with per-provider HMAC rules and a bounded
//! timestamp skew window. Replay protection beyond the skew window comes from
//! the idempotency ledger, not from here.

mod context;
mod error;
mod providers;
mod registry;
pub mod timestamp;

pub use context::{HashAlgorithm, HeaderNames, SignatureContext, SignatureEncoding, TimestampFormat};
pub use error::SignatureError;
pub use providers::{
    body_external_id, builtin, DigestedBodyVerifier, DottedBodyVerifier, PrefixedBodyVerifier,
    ProviderVerifier, BUILTIN_PROVIDERS,
};
pub use registry::{sign, SignatureVerifier, VerifiedDelivery};

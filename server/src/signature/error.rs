//! Signature verification errors.

use thiserror::Error;

/// Reasons a webhook delivery fails authentication.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// No verifier is registered for this provider id.
    #[error("unknown webhook provider '{0}'")]
    UnknownProvider(String),

    /// One or more required headers were absent or not valid UTF-8.
    #[error("missing required headers: {}", .0.join(", "))]
    MissingHeaders(Vec<String>),

    /// The timestamp header could not be parsed or lies in the future.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// The signed timestamp is older than the allowed skew window.
    #[error("timestamp is {age_secs}s old, outside the {max_skew_secs}s replay window")]
    ReplayTooOld { age_secs: i64, max_skew_secs: u64 },

    /// The signature does not match the canonical message.
    #[error("signature mismatch")]
    BadSignature,
}

impl SignatureError {
    /// Whether this failure should be logged as a possible replay attempt.
    #[must_use]
    pub const fn is_replay(&self) -> bool {
        matches!(self, Self::ReplayTooOld { .. })
    }

    /// Short label for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownProvider(_) => "unknown_provider",
            Self::MissingHeaders(_) => "missing_headers",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::ReplayTooOld { .. } => "replay_too_old",
            Self::BadSignature => "bad_signature",
        }
    }
}

//! Event bus errors.

use thiserror::Error;

/// Channel name failed the strict grammar.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid channel name")]
pub struct InvalidChannel;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Even the truncation pointer does not fit under the cap.
    #[error("event envelope of {size} bytes cannot fit under cap {cap}")]
    Oversized { size: usize, cap: usize },

    #[error("event transport unavailable: {0}")]
    Transport(String),

    #[error("event transport timed out")]
    Timeout,
}

impl From<fred::error::Error> for EventBusError {
    fn from(err: fred::error::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

//! Subscription hub errors.

use thiserror::Error;

use crate::events::InvalidChannel;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("invalid channel name")]
    InvalidChannel,

    #[error("not authorized for channel")]
    Forbidden,

    #[error("lead access check unavailable: {0}")]
    AccessUnavailable(String),

    #[error("connection is closed")]
    Closed,
}

impl HubError {
    /// Error code sent to the client in an `error` frame.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidChannel => "invalid_channel",
            Self::Forbidden => "forbidden",
            Self::AccessUnavailable(_) => "unavailable",
            Self::Closed => "closed",
        }
    }
}

impl From<InvalidChannel> for HubError {
    fn from(_: InvalidChannel) -> Self {
        Self::InvalidChannel
    }
}

impl From<sqlx::Error> for HubError {
    fn from(err: sqlx::Error) -> Self {
        Self::AccessUnavailable(err.to_string())
    }
}

//! Per-provider signing parameters.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

/// HMAC hash function used by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Compute the HMAC of `message` under `secret`.
    #[must_use]
    pub fn mac(self, secret: &[u8], message: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(secret)
                    .expect("HMAC can take key of any size");
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            Self::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                    .expect("HMAC can take key of any size");
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Constant-time check of `expected` against the HMAC of `message`.
    #[must_use]
    pub fn verify(self, secret: &[u8], message: &[u8], expected: &[u8]) -> bool {
        match self {
            Self::Sha1 => Hmac::<Sha1>::new_from_slice(secret)
                .map(|mut mac| {
                    mac.update(message);
                    mac.verify_slice(expected).is_ok()
                })
                .unwrap_or(false),
            Self::Sha256 => Hmac::<Sha256>::new_from_slice(secret)
                .map(|mut mac| {
                    mac.update(message);
                    mac.verify_slice(expected).is_ok()
                })
                .unwrap_or(false),
        }
    }
}

/// How a provider's signed timestamp is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    /// Unix seconds, e.g. `1760000000`.
    EpochSeconds,
    /// Unix milliseconds, e.g. `1760000000000`.
    EpochMillis,
    /// RFC 3339 / ISO-8601, e.g. `2026-10-16T12:00:00Z`.
    Rfc3339,
}

/// Text encoding of the signature header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureEncoding {
    Hex,
    Base64,
}

impl SignatureEncoding {
    /// Decode a received signature; `None` if it is not valid in this encoding.
    #[must_use]
    pub fn decode(self, raw: &str) -> Option<Vec<u8>> {
        match self {
            Self::Hex => hex::decode(raw.trim()).ok(),
            Self::Base64 => STANDARD.decode(raw.trim()).ok(),
        }
    }

    #[must_use]
    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            Self::Hex => hex::encode(bytes),
            Self::Base64 => STANDARD.encode(bytes),
        }
    }
}

/// Header names a provider sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderNames {
    pub signature: String,
    pub timestamp: String,
    /// Header carrying the provider's own delivery id, if any.
    pub event_id: Option<String>,
}

/// Immutable signing parameters for one provider.
#[derive(Debug, Clone)]
pub struct SignatureContext {
    pub provider: String,
    /// `None` only in non-production when no secret is configured.
    pub secret: Option<String>,
    pub algorithm: HashAlgorithm,
    pub headers: HeaderNames,
    pub timestamp_format: TimestampFormat,
    pub encoding: SignatureEncoding,
    pub max_skew: Duration,
}

impl SignatureContext {
    /// Whether deliveries for this provider are accepted without a signature.
    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.secret.is_none()
    }
}

//! Provider lookup and the verification procedure shared by every provider.

use std::collections::HashMap;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::error::SignatureError;
use super::providers::{self, ProviderVerifier, BUILTIN_PROVIDERS};
use super::timestamp;
use crate::config::{ConfigError, Environment};

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedDelivery {
    pub provider: String,
    /// Provider-side delivery id, or a digest of the body when none is sent.
    pub external_id: String,
    /// Timestamp header exactly as received.
    pub raw_timestamp: Option<String>,
    /// Signed timestamp; `None` for unsigned deliveries without one.
    pub signed_at: Option<DateTime<Utc>>,
    /// Accepted without a signature because no secret is configured.
    pub unsigned: bool,
}

/// Registry of provider verifiers, keyed by provider id.
#[derive(Default)]
pub struct SignatureVerifier {
    providers: HashMap<String, Box<dyn ProviderVerifier>>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.providers.keys().collect();
        ids.sort();
        f.debug_struct("SignatureVerifier").field("providers", &ids).finish()
    }
}

impl SignatureVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry of built-in providers.
    ///
    /// A provider without a secret is an error in production. Elsewhere it
    /// accepts unsigned deliveries and logs a warning.
    pub fn builtin(
        secrets: &HashMap<String, String>,
        environment: Environment,
        max_skew: Duration,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for provider in BUILTIN_PROVIDERS {
            let secret = secrets.get(provider).cloned();
            if secret.is_none() {
                if environment.is_production() {
                    return Err(ConfigError::MissingSecret(provider.to_string()));
                }
                warn!(
                    provider,
                    "No webhook secret configured; accepting unsigned deliveries"
                );
            }
            if let Some(verifier) = providers::builtin(provider, secret, max_skew) {
                registry.register(verifier);
            }
        }
        Ok(registry)
    }

    /// Register (or replace) a provider verifier.
    pub fn register(&mut self, verifier: Box<dyn ProviderVerifier>) {
        let id = verifier.context().provider.clone();
        self.providers.insert(id, verifier);
    }

    #[must_use]
    pub fn contains(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    #[must_use]
    pub fn get(&self, provider: &str) -> Option<&dyn ProviderVerifier> {
        self.providers.get(provider).map(AsRef::as_ref)
    }

    /// Verify a delivery against the current clock.
    pub fn verify(
        &self,
        provider: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<VerifiedDelivery, SignatureError> {
        self.verify_at(provider, headers, body, Utc::now())
    }

    /// Verify a delivery as of `now`.
    pub fn verify_at(
        &self,
        provider: &str,
        headers: &HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<VerifiedDelivery, SignatureError> {
        let verifier = self
            .get(provider)
            .ok_or_else(|| SignatureError::UnknownProvider(provider.to_string()))?;
        let ctx = verifier.context();

        let signature = header(headers, &ctx.headers.signature);
        let raw_timestamp = header(headers, &ctx.headers.timestamp);

        let mut missing = Vec::new();
        if !ctx.is_unsigned() {
            if signature.is_none() {
                missing.push(ctx.headers.signature.clone());
            }
            if raw_timestamp.is_none() {
                missing.push(ctx.headers.timestamp.clone());
            }
        }
        if let Some(name) = &ctx.headers.event_id {
            if header(headers, name).is_none() {
                missing.push(name.clone());
            }
        }
        if !missing.is_empty() {
            return Err(SignatureError::MissingHeaders(missing));
        }

        let signed_at = match raw_timestamp {
            Some(raw) => {
                let signed_at = timestamp::parse(ctx.timestamp_format, raw)?;
                if let Err(e) = timestamp::check_freshness(signed_at, now, ctx.max_skew) {
                    if e.is_replay() {
                        warn!(provider, error = %e, security_event = true, "Webhook replay rejected");
                    }
                    return Err(e);
                }
                Some(signed_at)
            }
            None => None,
        };

        if let (Some(secret), Some(raw_ts), Some(received)) =
            (ctx.secret.as_deref(), raw_timestamp, signature)
        {
            let message = verifier.canonical_message(raw_ts, body);
            let matches = ctx
                .encoding
                .decode(strip_scheme(received))
                .is_some_and(|sig| ctx.algorithm.verify(secret.as_bytes(), &message, &sig));
            if !matches {
                warn!(provider, security_event = true, "Webhook signature mismatch");
                return Err(SignatureError::BadSignature);
            }
        } else {
            warn!(provider, "Accepting unsigned webhook delivery");
        }

        let external_id = verifier
            .external_id(headers, body)
            .unwrap_or_else(|| hex::encode(Sha256::digest(body)));

        Ok(VerifiedDelivery {
            provider: provider.to_string(),
            external_id,
            raw_timestamp: raw_timestamp.map(str::to_string),
            signed_at,
            unsigned: ctx.is_unsigned(),
        })
    }
}

/// Signature header value `provider` would send for `body` at `timestamp`.
///
/// Returns `None` for unknown or unsigned providers.
#[must_use]
pub fn sign(
    registry: &SignatureVerifier,
    provider: &str,
    timestamp: &str,
    body: &[u8],
) -> Option<String> {
    let verifier = registry.get(provider)?;
    let ctx = verifier.context();
    let secret = ctx.secret.as_deref()?;
    let mac = ctx
        .algorithm
        .mac(secret.as_bytes(), &verifier.canonical_message(timestamp, body));
    Some(ctx.encoding.encode(&mac))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Accept `sha256=<sig>` style values as well as the bare signature.
fn strip_scheme(raw: &str) -> &str {
    match raw.split_once('=') {
        Some((scheme, rest)) if matches!(scheme, "sha1" | "sha256" | "v1") => rest,
        _ => raw,
    }
}

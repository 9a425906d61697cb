//! Built-in webhook providers.
//!
//! Each provider signs a different canonical message. Adding a provider means
//! writing a [`ProviderVerifier`] and registering it with the
//! [`SignatureVerifier`](super::SignatureVerifier); nothing else changes.

use std::time::Duration;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use super::context::{
    HashAlgorithm, HeaderNames, SignatureContext, SignatureEncoding, TimestampFormat,
};

/// Provider ids registered at startup.
pub const BUILTIN_PROVIDERS: [&str; 5] = ["callflow", "dialer", "pbx", "transcribe", "tasks"];

/// Body fields consulted, in order, for a provider-side delivery id.
const BODY_ID_FIELDS: [&str; 3] = ["event_id", "id", "call_id"];

/// One provider's signing rules.
pub trait ProviderVerifier: Send + Sync {
    /// Signing parameters for this provider.
    fn context(&self) -> &SignatureContext;

    /// Bytes the provider signs, built from the raw timestamp header and body.
    fn canonical_message(&self, timestamp: &str, body: &[u8]) -> Vec<u8>;

    /// Provider-side id of this delivery, if the provider supplies one.
    fn external_id(&self, headers: &HeaderMap, body: &[u8]) -> Option<String> {
        let _ = headers;
        body_external_id(body)
    }
}

/// Signs `timestamp + "." + hex(sha256(body))`, delivery id in a header.
#[derive(Debug, Clone)]
pub struct DigestedBodyVerifier {
    context: SignatureContext,
}

impl DigestedBodyVerifier {
    #[must_use]
    pub const fn new(context: SignatureContext) -> Self {
        Self { context }
    }
}

impl ProviderVerifier for DigestedBodyVerifier {
    fn context(&self) -> &SignatureContext {
        &self.context
    }

    fn canonical_message(&self, timestamp: &str, body: &[u8]) -> Vec<u8> {
        let digest = hex::encode(Sha256::digest(body));
        format!("{timestamp}.{digest}").into_bytes()
    }

    fn external_id(&self, headers: &HeaderMap, _body: &[u8]) -> Option<String> {
        header_external_id(&self.context, headers)
    }
}

/// Signs `timestamp + body` with no separator.
#[derive(Debug, Clone)]
pub struct PrefixedBodyVerifier {
    context: SignatureContext,
}

impl PrefixedBodyVerifier {
    #[must_use]
    pub const fn new(context: SignatureContext) -> Self {
        Self { context }
    }
}

impl ProviderVerifier for PrefixedBodyVerifier {
    fn context(&self) -> &SignatureContext {
        &self.context
    }

    fn canonical_message(&self, timestamp: &str, body: &[u8]) -> Vec<u8> {
        let mut message = Vec::with_capacity(timestamp.len() + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(body);
        message
    }
}

/// Signs `"{timestamp}." + raw body bytes`, delivery id in a header.
#[derive(Debug, Clone)]
pub struct DottedBodyVerifier {
    context: SignatureContext,
}

impl DottedBodyVerifier {
    #[must_use]
    pub const fn new(context: SignatureContext) -> Self {
        Self { context }
    }
}

impl ProviderVerifier for DottedBodyVerifier {
    fn context(&self) -> &SignatureContext {
        &self.context
    }

    fn canonical_message(&self, timestamp: &str, body: &[u8]) -> Vec<u8> {
        let mut message = Vec::with_capacity(timestamp.len() + 1 + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.push(b'.');
        message.extend_from_slice(body);
        message
    }

    fn external_id(&self, headers: &HeaderMap, _body: &[u8]) -> Option<String> {
        header_external_id(&self.context, headers)
    }
}

/// Build the verifier for a built-in provider id.
///
/// Returns `None` for ids outside [`BUILTIN_PROVIDERS`].
#[must_use]
pub fn builtin(
    provider: &str,
    secret: Option<String>,
    max_skew: Duration,
) -> Option<Box<dyn ProviderVerifier>> {
    let context = |algorithm, prefix: &str, event_id: Option<&str>, timestamp_format, encoding| {
        SignatureContext {
            provider: provider.to_string(),
            secret: secret.clone(),
            algorithm,
            headers: HeaderNames {
                signature: format!("x-{prefix}-signature"),
                timestamp: format!("x-{prefix}-timestamp"),
                event_id: event_id.map(|h| format!("x-{prefix}-{h}")),
            },
            timestamp_format,
            encoding,
            max_skew,
        }
    };

    let verifier: Box<dyn ProviderVerifier> = match provider {
        "callflow" => Box::new(DigestedBodyVerifier::new(context(
            HashAlgorithm::Sha256,
            "callflow",
            Some("event-id"),
            TimestampFormat::EpochSeconds,
            SignatureEncoding::Hex,
        ))),
        "dialer" => Box::new(PrefixedBodyVerifier::new(context(
            HashAlgorithm::Sha256,
            "dialer",
            None,
            TimestampFormat::EpochSeconds,
            SignatureEncoding::Hex,
        ))),
        "pbx" => Box::new(PrefixedBodyVerifier::new(context(
            HashAlgorithm::Sha1,
            "pbx",
            None,
            TimestampFormat::EpochSeconds,
            SignatureEncoding::Base64,
        ))),
        "transcribe" => Box::new(PrefixedBodyVerifier::new(context(
            HashAlgorithm::Sha256,
            "transcribe",
            None,
            TimestampFormat::Rfc3339,
            SignatureEncoding::Hex,
        ))),
        "tasks" => Box::new(DottedBodyVerifier::new(context(
            HashAlgorithm::Sha256,
            "task",
            Some("id"),
            TimestampFormat::EpochMillis,
            SignatureEncoding::Hex,
        ))),
        _ => return None,
    };
    Some(verifier)
}

fn header_external_id(context: &SignatureContext, headers: &HeaderMap) -> Option<String> {
    let name = context.headers.event_id.as_deref()?;
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Delivery id from the JSON body, if the body carries one.
#[must_use]
pub fn body_external_id(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    BODY_ID_FIELDS.iter().find_map(|field| match value.get(field)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

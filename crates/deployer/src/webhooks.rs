//! GitHub webhook payload parsing and signature verification.

use std::borrow::Cow;
use std::collections::HashSet;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Header carrying the HMAC-SHA256 signature.
pub const SIGNATURE_256_HEADER: &str = "x-hub-signature-256";
/// Legacy header carrying the HMAC-SHA1 signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature";
/// Header naming the event kind.
pub const EVENT_HEADER: &str = "x-github-event";
/// Header carrying the unique delivery ID.
pub const DELIVERY_HEADER: &str = "x-github-delivery";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Errors raised while authenticating or decoding a delivery.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("payload signature check failed")]
    InvalidSignature,

    /// Form-encoded delivery without a decodable `payload` field.
    #[error("invalid form payload: {0}")]
    InvalidForm(String),

    #[error("malformed {kind} payload: {source}")]
    MalformedPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Verify a GitHub webhook signature header against the raw body.
///
/// Accepts `sha256=<hex>` and the legacy `sha1=<hex>` form. The comparison
/// is constant-time.
#[must_use]
pub fn verify_webhook_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let Some((algorithm, hex_digest)) = signature.trim().split_once('=') else {
        return false;
    };

    let Ok(signature_bytes) = hex::decode(hex_digest) else {
        return false;
    };

    let computed = match algorithm {
        "sha256" => {
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        }
        "sha1" => {
            let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        }
        _ => return false,
    };

    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// Check the delivery's signature headers, preferring SHA-256.
pub fn verify_delivery(
    body: &[u8],
    signature_256: Option<&str>,
    signature_1: Option<&str>,
    secret: &str,
) -> Result<(), WebhookError> {
    let signature = signature_256
        .or(signature_1)
        .ok_or(WebhookError::MissingSignature)?;

    if verify_webhook_signature(body, signature, secret) {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

/// JSON document of a delivery.
///
/// Hooks configured with `application/x-www-form-urlencoded` send the JSON in
/// the `payload` form field; the signature still covers the raw body, so this
/// runs after verification.
pub fn delivery_payload<'a>(
    content_type: Option<&str>,
    body: &'a [u8],
) -> Result<Cow<'a, [u8]>, WebhookError> {
    let is_form = content_type
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE));
    if !is_form {
        return Ok(Cow::Borrowed(body));
    }

    let form = std::str::from_utf8(body).map_err(|e| WebhookError::InvalidForm(e.to_string()))?;
    let encoded = form
        .split('&')
        .find_map(|pair| pair.strip_prefix("payload="))
        .ok_or_else(|| WebhookError::InvalidForm("missing payload field".to_string()))?;
    let plus_decoded = encoded.replace('+', " ");
    let decoded = urlencoding::decode(&plus_decoded)
        .map_err(|e| WebhookError::InvalidForm(e.to_string()))?;

    Ok(Cow::Owned(decoded.into_owned().into_bytes()))
}

/// Repository owner as sent in push payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct Owner {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
}

/// Repository a delivery refers to.
#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub owner: Owner,
}

impl Repository {
    /// Owner account name, whichever field the payload populated.
    pub fn owner_name(&self) -> Option<&str> {
        self.owner
            .name
            .as_deref()
            .or(self.owner.login.as_deref())
            .filter(|name| !name.is_empty())
    }
}

/// One commit of a push.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushCommit {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
}

/// `push` event payload (the fields this service reads).
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    /// Commit SHA the ref points to after the push.
    #[serde(default)]
    pub after: Option<String>,
    pub repository: Repository,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
}

impl PushEvent {
    /// Paths added or modified by any commit, each listed once in
    /// first-seen order.
    pub fn changed_files(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.commits
            .iter()
            .flat_map(|commit| commit.added.iter().chain(&commit.modified))
            .filter(|path| seen.insert(*path))
            .cloned()
            .collect()
    }
}

/// Hook configuration echoed back in a `ping`.
#[derive(Debug, Clone, Deserialize)]
pub struct Hook {
    pub id: u64,
    #[serde(default)]
    pub events: Vec<String>,
}

/// `ping` event payload, sent when a hook is registered.
#[derive(Debug, Clone, Deserialize)]
pub struct PingEvent {
    #[serde(default)]
    pub zen: Option<String>,
    #[serde(default)]
    pub hook_id: Option<u64>,
    #[serde(default)]
    pub hook: Option<Hook>,
}

/// A decoded delivery, dispatched by its `X-GitHub-Event` header.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    /// A hook was registered; acknowledged only.
    HookRegistered(PingEvent),
    Push(PushEvent),
    /// Any event kind this service does not handle.
    Unsupported(String),
}

impl WebhookEvent {
    pub fn parse(kind: &str, body: &[u8]) -> Result<Self, WebhookError> {
        let malformed = |source| WebhookError::MalformedPayload {
            kind: kind.to_string(),
            source,
        };

        match kind {
            "ping" => serde_json::from_slice(body)
                .map(Self::HookRegistered)
                .map_err(malformed),
            "push" => serde_json::from_slice(body)
                .map(Self::Push)
                .map_err(malformed),
            other => Ok(Self::Unsupported(other.to_string())),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::HookRegistered(_) => "ping",
            Self::Push(_) => "push",
            Self::Unsupported(kind) => kind,
        }
    }
}

#[cfg(test)]
pub(crate) fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

//! Push-event webhook payloads and signatures

use hmac::Mac;
use serde::Deserialize;

use crate::errors::AgentError;
use crate::utils::{hmac_sha256_hex, HmacSha256};

/// Header carrying the payload signature
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Header naming the event type
pub const EVENT_HEADER: &str = "x-github-event";

/// The subset of a push-event payload the agent reads
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    /// Full ref name, e.g. `refs/heads/main`
    #[serde(rename = "ref")]
    pub git_ref: String,

    /// Commit the ref points to after the push
    #[serde(default)]
    pub after: Option<String>,

    /// Set when the push deleted the ref
    #[serde(default)]
    pub deleted: bool,

    #[serde(default)]
    pub pusher: Option<Pusher>,

    #[serde(default)]
    pub sender: Option<Sender>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pusher {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sender {
    pub login: String,
}

impl PushEvent {
    /// Parse a raw webhook body
    pub fn from_slice(body: &[u8]) -> Result<Self, AgentError> {
        serde_json::from_slice(body)
            .map_err(|e| AgentError::InvalidTrigger(format!("Malformed push payload: {}", e)))
    }

    /// Branch name, or `None` for tags and other refs
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }

    /// Who pushed; the account login wins over the git author name
    pub fn actor(&self) -> Option<&str> {
        self.sender
            .as_ref()
            .map(|s| s.login.as_str())
            .or_else(|| self.pusher.as_ref().map(|p| p.name.as_str()))
    }

    /// The pushed commit, unless the push carried the all-zero id
    pub fn head_commit(&self) -> Option<&str> {
        self.after
            .as_deref()
            .filter(|sha| !sha.is_empty() && !sha.bytes().all(|b| b == b'0'))
    }
}

/// Check an `X-Hub-Signature-256` header value against the raw body
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> Result<(), AgentError> {
    let header = header
        .ok_or_else(|| AgentError::InvalidTrigger("Missing webhook signature".to_string()))?;
    let provided = header
        .trim()
        .strip_prefix("sha256=")
        .ok_or_else(|| AgentError::InvalidTrigger("Unsupported signature scheme".to_string()))?;

    let provided = hex::decode(provided)
        .map_err(|_| AgentError::InvalidTrigger("Malformed webhook signature".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| AgentError::Internal(format!("HMAC key rejected: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| AgentError::InvalidTrigger("Webhook signature mismatch".to_string()))
}

/// Produce the header value a sender would attach to `body`
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    format!("sha256={}", hmac_sha256_hex(secret, body))
}

//! Callback body and signature.
//!
//! The completion callback is signed with HMAC-SHA256 over the canonical
//! string `k1=v1&k2=v2&…` — keys {action, challenge, device_id, session_id,
//! status, timestamp, user_id} in lexicographic order, hex lowercase. The
//! signing secret is the API key that initiated the session.

use serde::{Deserialize, Serialize};

use crate::crypto::hmac_sha256_hex;

/// Callback delivery statuses.
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

/// The POST body delivered to `callback_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRequest {
    pub session_id: String,
    pub username: String,
    pub status: String,
    pub challenge: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub device_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
}

impl CallbackRequest {
    /// Canonical string covered by the signature. Keys are fixed and sorted;
    /// the `user_id` key carries the username field.
    fn canonical_string(&self) -> String {
        format!(
            "action={}&challenge={}&device_id={}&session_id={}&status={}&timestamp={}&user_id={}",
            self.action,
            self.challenge,
            self.device_id,
            self.session_id,
            self.status,
            self.timestamp,
            self.username,
        )
    }
}

/// Compute the signature for a callback body.
pub fn generate_signature(req: &CallbackRequest, secret: &str) -> String {
    hmac_sha256_hex(secret.as_bytes(), req.canonical_string().as_bytes())
}

/// Verify a received callback body against its embedded signature.
pub fn verify_signature(req: &CallbackRequest, secret: &str) -> bool {
    let expected = generate_signature(req, secret);
    // Constant-time-ish compare: both sides are fixed-length hex digests.
    expected.len() == req.signature.len()
        && expected
            .bytes()
            .zip(req.signature.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

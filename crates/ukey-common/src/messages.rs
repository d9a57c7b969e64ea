//! Device ↔ server wire protocol.
//!
//! Every frame is a JSON envelope `{type, data, timestamp}`. After the
//! handshake completes, the only legal outer type is `encrypted`, whose
//! payload decrypts to another envelope that is dispatched recursively.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Envelope type names.
pub mod types {
    pub const KEY_EXCHANGE_REQUEST: &str = "key_exchange_request";
    pub const KEY_EXCHANGE_RESPONSE: &str = "key_exchange_response";
    pub const ENCRYPTED: &str = "encrypted";
    pub const DEVICE_CONNECTION: &str = "device_connection";
    pub const DEVICE_CONNECTION_RESPONSE: &str = "device_connection_response";
    pub const DEVICE_RECONNECT: &str = "device_reconnect";
    pub const DEVICE_INIT_REQUEST: &str = "device_init_request";
    pub const DEVICE_INIT_RESPONSE: &str = "device_init_response";
    pub const AUTH_REQUEST: &str = "auth_request";
    pub const AUTH_RESPONSE: &str = "auth_response";
    pub const AUTH_SUCCESS_RESPONSE: &str = "auth_success_response";
    pub const ONCE_KEY_UPDATE_CONFIRM: &str = "once_key_update_confirm";
    pub const DEVICE_STATUS_CHECK: &str = "device_status_check";
    pub const DEVICE_STATUS_RESPONSE: &str = "device_status_response";
    pub const FORCE_LOGOUT: &str = "force_logout";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
}

/// Error string a device sends in `auth_response.error` when the user
/// declined the confirmation prompt.
pub const USER_REJECTED_ERROR: &str = "user_rejected";

/// Connection-level device connect reply statuses.
pub mod connection_status {
    pub const CONNECTED: &str = "connected";
    pub const PENDING_ACTIVATION: &str = "pending_activation";
    pub const NO_MATCH: &str = "no_match";
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("frame is not valid JSON: {0}")]
    BadJson(String),
    #[error("frame has an empty type")]
    EmptyType,
    #[error("frame has no data")]
    MissingData,
    #[error("payload of `{msg_type}` is malformed: {detail}")]
    BadPayload { msg_type: String, detail: String },
}

/// The outer frame every message travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl WsEnvelope {
    /// Wrap a typed payload into an envelope stamped with the current time.
    pub fn new<T: Serialize>(msg_type: &str, payload: &T) -> Self {
        Self {
            msg_type: msg_type.to_owned(),
            data: serde_json::to_value(payload).expect("payload types serialize infallibly"),
            timestamp: Utc::now(),
        }
    }

    /// Parse and validate a raw frame.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, MessageError> {
        let envelope: WsEnvelope =
            serde_json::from_slice(raw).map_err(|e| MessageError::BadJson(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Reject frames with an empty type or absent data.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.msg_type.is_empty() {
            return Err(MessageError::EmptyType);
        }
        if self.data.is_null() {
            return Err(MessageError::MissingData);
        }
        Ok(())
    }

    /// Decode the payload into its typed form.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        serde_json::from_value(self.data.clone()).map_err(|e| MessageError::BadPayload {
            msg_type: self.msg_type.clone(),
            detail: e.to_string(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serializes infallibly")
    }
}

/// Handshake progression for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Pending,
    Completed,
    Failed,
}

// ============================================================
// Handshake
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchangeRequest {
    /// Base64 SEC1 client public key.
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchangeResponse {
    /// Base64 SEC1 server public key.
    pub public_key: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sealed frame carried inside the `encrypted` envelope type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Base64 ciphertext of an inner envelope.
    pub payload: String,
    /// Base64 12-byte GCM nonce.
    pub nonce: String,
}

// ============================================================
// Device lifecycle
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInitRequest {
    pub serial_number: String,
    pub volume_serial_number: String,
    #[serde(default)]
    pub device_path: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInitResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub once_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConnection {
    pub serial_number: String,
    pub volume_serial_number: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    /// Present when the device asks for a cross-platform match.
    #[serde(default)]
    pub totp_code: String,
    #[serde(default)]
    pub once_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConnectionResponse {
    pub success: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatusCheck {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatusResponse {
    pub status: String,
    pub serial_number: String,
    pub volume_serial_number: String,
}

// ============================================================
// Authentication flow
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub request_id: String,
    pub username: String,
    pub challenge: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default)]
    pub message: String,
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub request_id: String,
    pub success: bool,
    /// `challenge:_:onceKey:_:totpCode:_:serial:_:volSerial`
    #[serde(default)]
    pub auth_key: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub volume_serial_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSuccessResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_once_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnceKeyUpdateConfirm {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

// ============================================================
// Liveness & control
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceLogout {
    pub message: String,
}

/// Typed error frame sent to the peer before closing on protocol faults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error_code: String,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let ping = Ping { timestamp: Utc::now() };
        let env = WsEnvelope::new(types::PING, &ping);
        let raw = env.to_bytes();

        let parsed = WsEnvelope::from_bytes(&raw).unwrap();
        assert_eq!(parsed.msg_type, "ping");
        let _: Ping = parsed.parse().unwrap();
    }

    #[test]
    fn rejects_empty_type() {
        let raw = br#"{"type":"","data":{},"timestamp":"2026-01-01T00:00:00Z"}"#;
        assert!(matches!(
            WsEnvelope::from_bytes(raw),
            Err(MessageError::EmptyType)
        ));
    }

    #[test]
    fn rejects_missing_data() {
        let raw = br#"{"type":"ping","data":null,"timestamp":"2026-01-01T00:00:00Z"}"#;
        assert!(matches!(
            WsEnvelope::from_bytes(raw),
            Err(MessageError::MissingData)
        ));
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(
            WsEnvelope::from_bytes(b"not json"),
            Err(MessageError::BadJson(_))
        ));
    }

    #[test]
    fn payload_type_mismatch_is_reported() {
        let env = WsEnvelope::new(types::PING, &serde_json::json!({"nope": true}));
        let res: Result<AuthResponse, _> = env.parse();
        assert!(matches!(res, Err(MessageError::BadPayload { .. })));
    }
}

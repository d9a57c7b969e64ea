//! Authentication session — the server-side record of one authentication
//! attempt and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Session status. Transitions only advance along the state machine; a
/// terminal status is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Pending,
    Processing,
    ProcessingOncekey,
    Completed,
    Failed,
    Expired,
    Rejected,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::ProcessingOncekey => "processing_oncekey",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "processing_oncekey" => Some(Self::ProcessingOncekey),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Terminal sessions accept no further writes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthResult {
    Success,
    Failure,
}

impl AuthResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub api_key_id: Uuid,

    /// The device that answered, once one has.
    pub responding_device_id: Option<Uuid>,

    /// Caller-supplied nonce, echoed inside the signed device token.
    pub challenge: String,

    /// Permission label this authentication is for; empty means none.
    pub action: String,

    pub status: AuthStatus,
    pub result: Option<AuthResult>,

    pub callback_url: Option<String>,
    pub client_ip: String,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuthSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

// ============================================================
// REST DTOs
// ============================================================

#[derive(Debug, Deserialize, Validate)]
pub struct StartAuthRequest {
    #[validate(length(min = 1, message = "username is required"))]
    pub username: String,

    #[validate(length(min = 1, message = "challenge is required"))]
    pub challenge: String,

    #[serde(default)]
    pub action: String,

    #[serde(default)]
    pub message: String,

    /// Session lifetime in seconds.
    #[validate(range(min = 10, max = 300, message = "timeout must be 10-300 seconds"))]
    pub timeout: Option<u64>,

    #[validate(url(message = "callback_url must be a valid URL"))]
    pub callback_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyAuthRequest {
    pub session_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct StartAuthResponse {
    pub session_id: Uuid,
    pub status: AuthStatus,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct VerifyAuthResponse {
    pub status: AuthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AuthResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for status in [
            AuthStatus::Pending,
            AuthStatus::Processing,
            AuthStatus::ProcessingOncekey,
            AuthStatus::Completed,
            AuthStatus::Failed,
            AuthStatus::Expired,
            AuthStatus::Rejected,
        ] {
            assert_eq!(AuthStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(AuthStatus::from_str("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!AuthStatus::Pending.is_terminal());
        assert!(!AuthStatus::Processing.is_terminal());
        assert!(!AuthStatus::ProcessingOncekey.is_terminal());
        assert!(AuthStatus::Completed.is_terminal());
        assert!(AuthStatus::Failed.is_terminal());
        assert!(AuthStatus::Expired.is_terminal());
        assert!(AuthStatus::Rejected.is_terminal());
    }
}

//! API key — authenticates third-party callers and admin operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,

    pub name: String,

    /// The credential itself: 32 random bytes, lowercase hex. Unique.
    pub api_key: String,

    pub is_active: bool,

    /// Admin keys gate the CRUD surface. At least one active admin key must
    /// exist at all times.
    pub is_admin: bool,

    pub expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApiKey {
    /// Expired keys fail validation even while `is_active`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t < now)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateApiKeyRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateApiKeyRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: Option<String>,
    pub is_active: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_check() {
        let now = Utc::now();
        let mut key = ApiKey {
            id: Uuid::nil(),
            name: "test".into(),
            api_key: "00".repeat(32),
            is_active: true,
            is_admin: false,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(!key.is_expired(now));

        key.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(key.is_expired(now));

        key.expires_at = Some(now + chrono::Duration::hours(1));
        assert!(!key.is_expired(now));
    }
}

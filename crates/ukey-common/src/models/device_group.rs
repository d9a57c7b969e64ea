//! Device group — the cross-platform identity that owns the credential
//! material. One or more physical devices share a group's TOTP secret and
//! rolling OnceKey.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::permissions_allow;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub id: Uuid,

    /// Owning user; `None` until an administrator links one.
    pub user_id: Option<Uuid>,

    pub name: String,
    pub description: String,

    /// Permission labels member devices may answer for.
    pub permissions: Vec<String>,

    /// `otpauth://totp/…` URI holding the shared secret.
    #[serde(skip_serializing)]
    pub totp_secret_uri: String,

    /// Current rolling credential. Unique among active groups — it doubles
    /// as the lookup key for cross-platform matching.
    #[serde(skip_serializing)]
    pub once_key: String,

    /// The credential consumed by the previous successful authentication.
    #[serde(skip_serializing)]
    pub last_used_once_key: String,

    /// Deactivating cascades to all member devices.
    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceGroup {
    /// Whether this group's permissions cover `action`.
    pub fn allows_action(&self, action: &str) -> bool {
        permissions_allow(&self.permissions, action)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateDeviceGroupRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: Option<String>,
    pub description: Option<String>,
    pub permissions: Option<Vec<String>>,
    /// Relink the group to a different user.
    pub user_id: Option<Uuid>,
    pub is_active: Option<bool>,
}

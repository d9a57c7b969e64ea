//! User model — the identity an authentication request targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// A user account. Created by an administrator; devices are attached
/// through device groups, never directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,

    /// Unique login-style name third-party callers address the user by.
    pub username: String,

    /// Permission labels the user may be granted on device groups.
    pub permissions: Vec<String>,

    /// Soft switch — deactivating disconnects all the user's devices.
    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(length(min = 3, max = 64, message = "Username must be 3-64 characters"))]
    pub username: String,

    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[validate(length(min = 3, max = 64, message = "Username must be 3-64 characters"))]
    pub username: Option<String>,
    pub permissions: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

//! Centralized error types for the EasyUKey server.
//!
//! Uses `thiserror` for ergonomic error definitions and provides HTTP-friendly
//! conversion into the API response envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Core application error type used across all server crates.
#[derive(Debug, thiserror::Error)]
pub enum UkeyError {
    // === API-key auth ===
    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Admin privileges required")]
    AdminRequired,

    #[error("Permission denied: {action}")]
    PermissionDenied { action: String },

    // === Resource errors ===
    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    // === Validation ===
    #[error("Validation failed: {message}")]
    Validation { message: String },

    // === Availability ===
    #[error("User is not online")]
    UserNotOnline,

    // === Infrastructure ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// API response envelope shared by every REST endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
            total: None,
        }
    }

    pub fn list(data: T, total: i64) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
            total: Some(total),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
            total: None,
        }
    }
}

impl UkeyError {
    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidApiKey => StatusCode::UNAUTHORIZED,
            Self::AdminRequired | Self::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::AlreadyExists { .. } | Self::Conflict { .. } | Self::Validation { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::UserNotOnline => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UkeyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't leak internal details to clients
        let message = match &self {
            UkeyError::Database(e) => {
                tracing::error!("Database error: {e}");
                "An internal error occurred".to_string()
            }
            UkeyError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ApiResponse::<()> {
            success: false,
            message: Some(message),
            data: None,
            total: None,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using UkeyError.
pub type UkeyResult<T> = Result<T, UkeyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_contract() {
        assert_eq!(UkeyError::InvalidApiKey.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(UkeyError::AdminRequired.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            UkeyError::NotFound { resource: "User".into() }.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            UkeyError::AlreadyExists { resource: "Device".into() }.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(UkeyError::UserNotOnline.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

//! Authentication routes — the third-party caller surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{ConnectInfo, State},
    routing::post,
};
use ukey_common::error::{ApiResponse, UkeyResult};
use ukey_common::models::auth_session::{
    StartAuthRequest, StartAuthResponse, VerifyAuthRequest, VerifyAuthResponse,
};
use ukey_common::validation::validate_request;

use crate::{AppState, middleware::ApiKeyContext};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth", post(start_auth))
        .route("/auth/verify", post(verify_auth))
}

/// POST /api/v1/auth
///
/// Start an authentication session for a user. Exactly one `auth_request`
/// is pushed to the user's online device.
async fn start_auth(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<ApiKeyContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<StartAuthRequest>,
) -> UkeyResult<Json<ApiResponse<StartAuthResponse>>> {
    validate_request(&body)?;

    let response = state
        .coordinator
        .start_auth(&body, &ctx.key, &addr.ip().to_string())
        .await?;

    Ok(Json(ApiResponse::ok(response)))
}

/// POST /api/v1/auth/verify
///
/// Report the current state of a session. Overdue sessions are expired
/// on read.
async fn verify_auth(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyAuthRequest>,
) -> UkeyResult<Json<ApiResponse<VerifyAuthResponse>>> {
    let response = state.coordinator.verify_auth(body.session_id).await?;
    Ok(Json(ApiResponse::ok(response)))
}

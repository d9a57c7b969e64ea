//! Middleware — API-key extraction and the admin gate.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use ukey_common::error::UkeyError;
use ukey_common::models::api_key::ApiKey;
use ukey_db::repository::api_keys;

use crate::AppState;

/// Caller identity extracted from the `X-API-Key` header.
#[derive(Debug, Clone)]
pub struct ApiKeyContext {
    pub key: ApiKey,
}

/// Validate the `X-API-Key` header against active, unexpired keys.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, UkeyError> {
    let ctx = authenticate(&state, &request).await?;
    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

/// Same as [`require_api_key`], additionally requiring `is_admin`.
pub async fn require_admin_key(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, UkeyError> {
    let ctx = authenticate(&state, &request).await?;
    if !ctx.key.is_admin {
        return Err(UkeyError::AdminRequired);
    }
    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

async fn authenticate(state: &AppState, request: &Request) -> Result<ApiKeyContext, UkeyError> {
    let presented = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or(UkeyError::InvalidApiKey)?;

    let key = api_keys::find_active_by_key(&state.db.pool, presented)
        .await?
        .ok_or(UkeyError::InvalidApiKey)?;

    if key.is_expired(Utc::now()) {
        return Err(UkeyError::InvalidApiKey);
    }

    Ok(ApiKeyContext { key })
}

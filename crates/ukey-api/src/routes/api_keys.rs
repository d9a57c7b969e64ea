//! Admin API-key management.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use ukey_common::crypto;
use ukey_common::error::{ApiResponse, UkeyError, UkeyResult};
use ukey_common::ids;
use ukey_common::models::api_key::{ApiKey, CreateApiKeyRequest, UpdateApiKeyRequest};
use ukey_common::validation::validate_request;
use ukey_db::repository::api_keys::{self, DeleteOutcome};
use uuid::Uuid;

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/api-keys", get(list_keys).post(create_key))
        .route("/admin/api-keys/{id}", axum::routing::put(update_key).delete(delete_key))
}

async fn list_keys(
    State(state): State<Arc<AppState>>,
) -> UkeyResult<Json<ApiResponse<Vec<ApiKey>>>> {
    let items = api_keys::list_api_keys(&state.db.pool).await?;
    let total = items.len() as i64;
    Ok(Json(ApiResponse::list(items, total)))
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateApiKeyRequest>,
) -> UkeyResult<Json<ApiResponse<ApiKey>>> {
    validate_request(&body)?;

    let key = api_keys::create_api_key(
        &state.db.pool,
        ids::generate_id(),
        &body.name,
        &crypto::generate_api_key(),
        body.is_admin,
        body.expires_at,
    )
    .await?;

    tracing::info!(key_id = %key.id, name = %key.name, is_admin = key.is_admin,
        "API key created");
    Ok(Json(ApiResponse::ok(key)))
}

async fn update_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateApiKeyRequest>,
) -> UkeyResult<Json<ApiResponse<ApiKey>>> {
    validate_request(&body)?;

    let target = api_keys::find_by_id(&state.db.pool, id)
        .await?
        .ok_or(UkeyError::NotFound { resource: "API key".into() })?;

    // Deactivating the final admin key would lock the admin surface out.
    if body.is_active == Some(false) && target.is_admin && target.is_active {
        let admins = api_keys::count_active_admin_keys(&state.db.pool).await?;
        if admins <= 1 {
            return Err(UkeyError::Conflict {
                message: "cannot deactivate the last admin API key".into(),
            });
        }
    }

    let key = api_keys::update_api_key(&state.db.pool, id, body.name.as_deref(), body.is_active)
        .await?
        .ok_or(UkeyError::NotFound { resource: "API key".into() })?;
    Ok(Json(ApiResponse::ok(key)))
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> UkeyResult<Json<ApiResponse<()>>> {
    match api_keys::delete_api_key(&state.db.pool, id).await? {
        DeleteOutcome::Deleted => {
            tracing::info!(key_id = %id, "API key deleted");
            Ok(Json(ApiResponse::msg("API key deleted")))
        }
        DeleteOutcome::NotFound => Err(UkeyError::NotFound { resource: "API key".into() }),
        DeleteOutcome::LastAdmin => Err(UkeyError::Conflict {
            message: "cannot delete the last admin API key".into(),
        }),
    }
}

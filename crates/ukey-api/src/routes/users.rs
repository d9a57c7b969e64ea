//! Admin user CRUD.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::get,
};
use ukey_common::error::{ApiResponse, UkeyError, UkeyResult};
use ukey_common::hub::DeviceHub;
use ukey_common::ids;
use ukey_common::models::user::{CreateUserRequest, UpdateUserRequest, User};
use ukey_common::validation::validate_request;
use ukey_db::repository::{devices, users};
use uuid::Uuid;

use super::Pagination;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/users", get(list_users).post(create_user))
        .route(
            "/admin/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
}

async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> UkeyResult<Json<ApiResponse<Vec<User>>>> {
    let (limit, offset) = page.limits();
    let items = users::list_users(&state.db.pool, limit, offset).await?;
    let total = users::count_users(&state.db.pool).await?;
    Ok(Json(ApiResponse::list(items, total)))
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateUserRequest>,
) -> UkeyResult<Json<ApiResponse<User>>> {
    validate_request(&body)?;

    if users::find_by_username(&state.db.pool, &body.username)
        .await?
        .is_some()
    {
        return Err(UkeyError::AlreadyExists { resource: "Username".into() });
    }

    let user = users::create_user(
        &state.db.pool,
        ids::generate_id(),
        &body.username,
        &body.permissions,
    )
    .await?;

    tracing::info!(user_id = %user.id, username = %user.username, "User created");
    Ok(Json(ApiResponse::ok(user)))
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> UkeyResult<Json<ApiResponse<User>>> {
    let user = users::find_by_id(&state.db.pool, id)
        .await?
        .ok_or(UkeyError::NotFound { resource: "User".into() })?;
    Ok(Json(ApiResponse::ok(user)))
}

async fn update_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateUserRequest>,
) -> UkeyResult<Json<ApiResponse<User>>> {
    validate_request(&body)?;

    users::find_by_id(&state.db.pool, id)
        .await?
        .ok_or(UkeyError::NotFound { resource: "User".into() })?;

    let user = users::update_user(
        &state.db.pool,
        id,
        body.username.as_deref(),
        body.permissions.as_deref(),
        body.is_active,
    )
    .await?;

    // Deactivation is a soft delete: every online device goes with it.
    if body.is_active == Some(false) {
        disconnect_user_devices(&state, id).await?;
    }

    Ok(Json(ApiResponse::ok(user)))
}

async fn delete_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> UkeyResult<Json<ApiResponse<()>>> {
    disconnect_user_devices(&state, id).await?;

    if !users::delete_user(&state.db.pool, id).await? {
        return Err(UkeyError::NotFound { resource: "User".into() });
    }

    tracing::info!(user_id = %id, "User deleted");
    Ok(Json(ApiResponse::msg("user deleted")))
}

async fn disconnect_user_devices(state: &AppState, user_id: Uuid) -> UkeyResult<()> {
    let member_devices = devices::list_active_by_user(&state.db.pool, user_id).await?;
    for device in member_devices {
        if state.hub.is_device_online(device.id) {
            state.hub.on_device_disconnect(device.id);
        }
    }
    Ok(())
}

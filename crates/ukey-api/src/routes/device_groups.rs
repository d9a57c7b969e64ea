//! Admin device-group surface — the credential-owning identity.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::get,
};
use ukey_common::error::{ApiResponse, UkeyError, UkeyResult};
use ukey_common::hub::DeviceHub;
use ukey_common::models::device_group::{DeviceGroup, UpdateDeviceGroupRequest};
use ukey_common::validation::validate_request;
use ukey_db::repository::{device_groups, devices, users};
use uuid::Uuid;

use super::Pagination;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/device-groups", get(list_groups))
        .route(
            "/admin/device-groups/{id}",
            get(get_group).put(update_group).delete(delete_group),
        )
}

async fn list_groups(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> UkeyResult<Json<ApiResponse<Vec<DeviceGroup>>>> {
    let (limit, offset) = page.limits();
    let items = device_groups::list_groups(&state.db.pool, limit, offset).await?;
    let total = device_groups::count_groups(&state.db.pool).await?;
    Ok(Json(ApiResponse::list(items, total)))
}

async fn get_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> UkeyResult<Json<ApiResponse<DeviceGroup>>> {
    let group = device_groups::find_by_id(&state.db.pool, id)
        .await?
        .ok_or(UkeyError::NotFound { resource: "Device group".into() })?;
    Ok(Json(ApiResponse::ok(group)))
}

async fn update_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateDeviceGroupRequest>,
) -> UkeyResult<Json<ApiResponse<DeviceGroup>>> {
    validate_request(&body)?;

    device_groups::find_by_id(&state.db.pool, id)
        .await?
        .ok_or(UkeyError::NotFound { resource: "Device group".into() })?;

    let updated = device_groups::update_group(
        &state.db.pool,
        id,
        body.name.as_deref(),
        body.description.as_deref(),
        body.permissions.as_deref(),
        body.is_active,
    )
    .await?
    .ok_or(UkeyError::NotFound { resource: "Device group".into() })?;

    // Relink: bind the group's online devices to the new user. The hub
    // enforces the single-session policy, evicting the user's previous
    // session if it lives on another device.
    if let Some(user_id) = body.user_id {
        users::find_by_id(&state.db.pool, user_id)
            .await?
            .ok_or(UkeyError::NotFound { resource: "User".into() })?;
        device_groups::relink_user(&state.db.pool, id, Some(user_id)).await?;

        let members = devices::list_devices(&state.db.pool, Some(id), None, 100, 0).await?;
        for device in members {
            if state.hub.is_device_online(device.id) {
                if let Err(e) = state.hub.link_device_to_user(device.id, user_id) {
                    tracing::warn!(device_id = %device.id, error = %e,
                        "could not relink online device");
                }
            }
        }
    }

    // Deactivation cascaded to member devices in storage; drop their
    // connections too.
    if body.is_active == Some(false) {
        let members = devices::list_devices(&state.db.pool, Some(id), None, 100, 0).await?;
        for device in members {
            if state.hub.is_device_online(device.id) {
                state.hub.on_device_disconnect(device.id);
            }
        }
    }

    let group = device_groups::find_by_id(&state.db.pool, id)
        .await?
        .unwrap_or(updated);
    Ok(Json(ApiResponse::ok(group)))
}

async fn delete_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> UkeyResult<Json<ApiResponse<()>>> {
    let members = devices::list_devices(&state.db.pool, Some(id), None, 100, 0).await?;
    for device in members {
        state.hub.on_device_disconnect(device.id);
    }

    if !device_groups::delete_group(&state.db.pool, id).await? {
        return Err(UkeyError::NotFound { resource: "Device group".into() });
    }

    tracing::info!(group_id = %id, "Device group deleted");
    Ok(Json(ApiResponse::msg("device group deleted")))
}

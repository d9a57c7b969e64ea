//! Admin device surface — listing, activation, forced offline.
//!
//! `is_online` in every response is the hub's live view, not the mirrored
//! column: the column converges within one status-sync flush but the admin
//! panel wants the truth now.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::Deserialize;
use ukey_common::error::{ApiResponse, UkeyError, UkeyResult};
use ukey_common::hub::DeviceHub;
use ukey_common::messages::{self, DeviceStatusCheck, WsEnvelope};
use ukey_common::models::device::{Device, UpdateDeviceRequest};
use ukey_common::validation::validate_request;
use ukey_db::repository::{device_groups, devices};
use uuid::Uuid;

use super::Pagination;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/devices", get(list_devices))
        .route("/admin/devices/stats", get(device_stats))
        .route(
            "/admin/devices/{id}",
            get(get_device).put(update_device).delete(delete_device),
        )
        .route("/admin/devices/{id}/offline", post(force_offline))
        .route("/admin/devices/status-check", post(status_check))
}

#[derive(Debug, Deserialize)]
struct DeviceFilter {
    group_id: Option<Uuid>,
    is_active: Option<bool>,
    is_online: Option<bool>,
    page: Option<i64>,
    page_size: Option<i64>,
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<DeviceFilter>,
) -> UkeyResult<Json<ApiResponse<Vec<Device>>>> {
    let (limit, offset) = Pagination { page: filter.page, page_size: filter.page_size }.limits();
    let mut items =
        devices::list_devices(&state.db.pool, filter.group_id, filter.is_active, limit, offset)
            .await?;

    for device in &mut items {
        device.is_online = state.hub.is_device_online(device.id);
    }
    if let Some(want_online) = filter.is_online {
        items.retain(|d| d.is_online == want_online);
    }

    let total = items.len() as i64;
    Ok(Json(ApiResponse::list(items, total)))
}

async fn device_stats(
    State(state): State<Arc<AppState>>,
) -> UkeyResult<Json<ApiResponse<serde_json::Value>>> {
    let total = devices::count_devices(&state.db.pool, None).await?;
    let active = devices::count_devices(&state.db.pool, Some(true)).await?;
    let grouped = devices::count_grouped(&state.db.pool).await?;
    let online = state.hub.online_device_count() as i64;

    Ok(Json(ApiResponse::ok(serde_json::json!({
        "total": total,
        "online": online,
        "active": active,
        "grouped": grouped,
    }))))
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> UkeyResult<Json<ApiResponse<Device>>> {
    let mut device = devices::find_by_id(&state.db.pool, id)
        .await?
        .ok_or(UkeyError::NotFound { resource: "Device".into() })?;
    device.is_online = state.hub.is_device_online(device.id);
    Ok(Json(ApiResponse::ok(device)))
}

async fn update_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateDeviceRequest>,
) -> UkeyResult<Json<ApiResponse<Device>>> {
    validate_request(&body)?;
    if body.name.is_none() && body.remark.is_none() && body.is_active.is_none() {
        return Err(UkeyError::Validation { message: "nothing to update".into() });
    }

    let before = devices::find_by_id(&state.db.pool, id)
        .await?
        .ok_or(UkeyError::NotFound { resource: "Device".into() })?;

    let mut device = devices::update_device(
        &state.db.pool,
        id,
        body.name.as_deref(),
        body.remark.as_deref(),
        body.is_active,
    )
    .await?
    .ok_or(UkeyError::NotFound { resource: "Device".into() })?;

    // Activation flips adjust hub linkage for an online device.
    if let Some(active) = body.is_active {
        if active != before.is_active && state.hub.is_device_online(id) {
            if !active {
                state.hub.on_device_disconnect(id);
            } else if let Some(group_id) = device.device_group_id {
                if let Some(group) = device_groups::find_by_id(&state.db.pool, group_id).await? {
                    if let Some(user_id) = group.user_id {
                        if let Err(e) = state.hub.link_device_to_user(id, user_id) {
                            tracing::warn!(device_id = %id, error = %e,
                                "could not link activated device to user");
                        }
                    }
                }
            }
        }
    }

    device.is_online = state.hub.is_device_online(device.id);
    Ok(Json(ApiResponse::ok(device)))
}

async fn delete_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> UkeyResult<Json<ApiResponse<()>>> {
    state.hub.on_device_disconnect(id);

    if !devices::delete_device(&state.db.pool, id).await? {
        return Err(UkeyError::NotFound { resource: "Device".into() });
    }

    tracing::info!(device_id = %id, "Device deleted");
    Ok(Json(ApiResponse::msg("device deleted")))
}

/// POST /api/v1/admin/devices/status-check — ask every connected device to
/// report its status.
async fn status_check(
    State(state): State<Arc<AppState>>,
) -> UkeyResult<Json<ApiResponse<serde_json::Value>>> {
    let online = state.hub.online_device_count() as i64;
    state.hub.broadcast(WsEnvelope::new(
        messages::types::DEVICE_STATUS_CHECK,
        &DeviceStatusCheck { timestamp: chrono::Utc::now() },
    ));
    Ok(Json(ApiResponse::ok(serde_json::json!({ "requested": online }))))
}

/// POST /api/v1/admin/devices/{id}/offline — drop the device's connection.
async fn force_offline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> UkeyResult<Json<ApiResponse<Device>>> {
    let mut device = devices::find_by_id(&state.db.pool, id)
        .await?
        .ok_or(UkeyError::NotFound { resource: "Device".into() })?;

    state.hub.on_device_disconnect(id);
    device.is_online = false;

    tracing::info!(device_id = %id, "Device forced offline");
    Ok(Json(ApiResponse::ok(device)))
}

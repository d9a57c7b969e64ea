//! Device repository — physical media rows and the presence columns the
//! status synchroniser owns.

use chrono::Utc;
use ukey_common::models::device::{Device, DeviceStatusUpdate};
use uuid::Uuid;

use super::{opt_ts, ts};

/// Insert a device inside an already-open transaction (device-init and
/// cross-platform-match paths).
pub async fn insert_device(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    device: &Device,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO devices
            (id, device_group_id, name, serial_number, volume_serial_number,
             vendor, model, remark, is_active, is_online,
             last_heartbeat, last_online_at, last_offline_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(device.id.to_string())
    .bind(device.device_group_id.map(|g| g.to_string()))
    .bind(&device.name)
    .bind(&device.serial_number)
    .bind(&device.volume_serial_number)
    .bind(&device.vendor)
    .bind(&device.model)
    .bind(&device.remark)
    .bind(device.is_active)
    .bind(device.is_online)
    .bind(opt_ts(device.last_heartbeat))
    .bind(opt_ts(device.last_online_at))
    .bind(opt_ts(device.last_offline_at))
    .bind(ts(device.created_at))
    .bind(ts(device.updated_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Standalone insert for the cross-platform match path.
pub async fn create_device(pool: &sqlx::AnyPool, device: &Device) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    insert_device(&mut tx, device).await?;
    tx.commit().await
}

pub async fn find_by_id(pool: &sqlx::AnyPool, id: Uuid) -> Result<Option<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await
}

/// Look up the physical identity: the (serial, volume serial) pair.
pub async fn find_by_serial(
    pool: &sqlx::AnyPool,
    serial_number: &str,
    volume_serial_number: &str,
) -> Result<Option<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>(
        "SELECT * FROM devices WHERE serial_number = ? AND volume_serial_number = ?",
    )
    .bind(serial_number)
    .bind(volume_serial_number)
    .fetch_optional(pool)
    .await
}

/// All active devices whose group belongs to `user_id`, most recent
/// heartbeat first (the Start-Auth candidate list).
pub async fn list_active_by_user(
    pool: &sqlx::AnyPool,
    user_id: Uuid,
) -> Result<Vec<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>(
        r#"
        SELECT d.* FROM devices d
        INNER JOIN device_groups g ON g.id = d.device_group_id
        WHERE g.user_id = ? AND d.is_active = TRUE AND g.is_active = TRUE
        ORDER BY d.last_heartbeat DESC
        "#,
    )
    .bind(user_id.to_string())
    .fetch_all(pool)
    .await
}

pub async fn list_devices(
    pool: &sqlx::AnyPool,
    group_id: Option<Uuid>,
    is_active: Option<bool>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>(
        r#"
        SELECT * FROM devices
        WHERE (? IS NULL OR device_group_id = ?)
          AND (? IS NULL OR is_active = ?)
        ORDER BY last_heartbeat DESC, created_at DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(group_id.map(|g| g.to_string()))
    .bind(group_id.map(|g| g.to_string()))
    .bind(is_active)
    .bind(is_active)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

pub async fn count_devices(
    pool: &sqlx::AnyPool,
    is_active: Option<bool>,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM devices WHERE (? IS NULL OR is_active = ?)")
            .bind(is_active)
            .bind(is_active)
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

pub async fn count_grouped(pool: &sqlx::AnyPool) -> Result<i64, sqlx::Error> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM devices WHERE device_group_id IS NOT NULL")
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

/// Update admin-editable device fields.
pub async fn update_device(
    pool: &sqlx::AnyPool,
    id: Uuid,
    name: Option<&str>,
    remark: Option<&str>,
    is_active: Option<bool>,
) -> Result<Option<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>(
        r#"
        UPDATE devices SET
            name = COALESCE(?, name),
            remark = COALESCE(?, remark),
            is_active = COALESCE(?, is_active),
            updated_at = ?
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(name)
    .bind(remark)
    .bind(is_active)
    .bind(ts(Utc::now()))
    .bind(id.to_string())
    .fetch_optional(pool)
    .await
}

pub async fn delete_device(pool: &sqlx::AnyPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM devices WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Flush a batch of coalesced presence updates: one transaction, one UPDATE
/// per dirty device. This function (and its single-row variant) are the
/// only writers of the presence columns.
pub async fn apply_status_updates(
    pool: &sqlx::AnyPool,
    updates: &[DeviceStatusUpdate],
) -> Result<(), sqlx::Error> {
    if updates.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    for update in updates {
        apply_status_update_in_tx(&mut tx, update).await?;
    }
    tx.commit().await
}

/// Direct single-row write, used when the update channel is saturated.
pub async fn apply_status_update(
    pool: &sqlx::AnyPool,
    update: &DeviceStatusUpdate,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    apply_status_update_in_tx(&mut tx, update).await?;
    tx.commit().await
}

async fn apply_status_update_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    update: &DeviceStatusUpdate,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE devices SET
            is_online = COALESCE(?, is_online),
            last_online_at = COALESCE(?, last_online_at),
            last_offline_at = COALESCE(?, last_offline_at),
            last_heartbeat = COALESCE(?, last_heartbeat),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(update.is_online)
    .bind(opt_ts(update.last_online_at))
    .bind(opt_ts(update.last_offline_at))
    .bind(opt_ts(update.last_heartbeat))
    .bind(ts(update.at))
    .bind(update.device_id.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

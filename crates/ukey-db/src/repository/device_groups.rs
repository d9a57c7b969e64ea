//! Device-group repository — credential material and group membership.

use chrono::Utc;
use ukey_common::models::device::Device;
use ukey_common::models::device_group::DeviceGroup;
use uuid::Uuid;

use super::{perms, ts};

/// Create a device group and its first device in one transaction
/// (device-init path). Both rows start inactive, awaiting admin activation.
pub async fn create_group_with_device(
    pool: &sqlx::AnyPool,
    group: &DeviceGroup,
    device: &Device,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO device_groups
            (id, user_id, name, description, permissions, totp_secret_uri,
             once_key, last_used_once_key, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(group.id.to_string())
    .bind(group.user_id.map(|u| u.to_string()))
    .bind(&group.name)
    .bind(&group.description)
    .bind(perms(&group.permissions))
    .bind(&group.totp_secret_uri)
    .bind(&group.once_key)
    .bind(&group.last_used_once_key)
    .bind(group.is_active)
    .bind(ts(group.created_at))
    .bind(ts(group.updated_at))
    .execute(&mut *tx)
    .await?;

    super::devices::insert_device(&mut tx, device).await?;

    tx.commit().await
}

pub async fn find_by_id(
    pool: &sqlx::AnyPool,
    id: Uuid,
) -> Result<Option<DeviceGroup>, sqlx::Error> {
    sqlx::query_as::<_, DeviceGroup>("SELECT * FROM device_groups WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await
}

/// Cross-platform match lookup: an active group currently holding this
/// once_key. The key is unique among active groups by invariant.
pub async fn find_active_by_once_key(
    pool: &sqlx::AnyPool,
    once_key: &str,
) -> Result<Option<DeviceGroup>, sqlx::Error> {
    sqlx::query_as::<_, DeviceGroup>(
        "SELECT * FROM device_groups WHERE once_key = ? AND is_active = TRUE",
    )
    .bind(once_key)
    .fetch_optional(pool)
    .await
}

pub async fn list_groups(
    pool: &sqlx::AnyPool,
    limit: i64,
    offset: i64,
) -> Result<Vec<DeviceGroup>, sqlx::Error> {
    sqlx::query_as::<_, DeviceGroup>(
        "SELECT * FROM device_groups ORDER BY created_at DESC LIMIT ? OFFSET ?",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

pub async fn count_groups(pool: &sqlx::AnyPool) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM device_groups")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// Update group metadata; deactivation cascades `is_active = FALSE` to all
/// member devices in the same transaction.
pub async fn update_group(
    pool: &sqlx::AnyPool,
    id: Uuid,
    name: Option<&str>,
    description: Option<&str>,
    permissions: Option<&[String]>,
    is_active: Option<bool>,
) -> Result<Option<DeviceGroup>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let now = ts(Utc::now());

    let updated = sqlx::query_as::<_, DeviceGroup>(
        r#"
        UPDATE device_groups SET
            name = COALESCE(?, name),
            description = COALESCE(?, description),
            permissions = COALESCE(?, permissions),
            is_active = COALESCE(?, is_active),
            updated_at = ?
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(name)
    .bind(description)
    .bind(permissions.map(perms))
    .bind(is_active)
    .bind(&now)
    .bind(id.to_string())
    .fetch_optional(&mut *tx)
    .await?;

    if is_active == Some(false) {
        sqlx::query(
            "UPDATE devices SET is_active = FALSE, updated_at = ? WHERE device_group_id = ?",
        )
        .bind(&now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(updated)
}

/// Rebind a group to a user (or unlink with `None`).
pub async fn relink_user(
    pool: &sqlx::AnyPool,
    id: Uuid,
    user_id: Option<Uuid>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE device_groups SET user_id = ?, updated_at = ? WHERE id = ?")
        .bind(user_id.map(|u| u.to_string()))
        .bind(ts(Utc::now()))
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Commit a OnceKey rotation. Guarded on the old key so the rotation is
/// all-or-nothing: if anything else rotated the group first, zero rows
/// change and the caller must not report success.
pub async fn rotate_once_key(
    pool: &sqlx::AnyPool,
    id: Uuid,
    old_key: &str,
    new_key: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE device_groups
        SET last_used_once_key = once_key, once_key = ?, updated_at = ?
        WHERE id = ? AND once_key = ?
        "#,
    )
    .bind(new_key)
    .bind(ts(Utc::now()))
    .bind(id.to_string())
    .bind(old_key)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_group(pool: &sqlx::AnyPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM device_groups WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

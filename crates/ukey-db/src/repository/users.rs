//! User repository — CRUD operations for user accounts.

use chrono::Utc;
use ukey_common::models::user::User;
use uuid::Uuid;

use super::{perms, ts};

/// Create a new user account.
pub async fn create_user(
    pool: &sqlx::AnyPool,
    id: Uuid,
    username: &str,
    permissions: &[String],
) -> Result<User, sqlx::Error> {
    let now = ts(Utc::now());
    sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (id, username, permissions, is_active, created_at, updated_at)
        VALUES (?, ?, ?, TRUE, ?, ?)
        RETURNING *
        "#,
    )
    .bind(id.to_string())
    .bind(username)
    .bind(perms(permissions))
    .bind(&now)
    .bind(&now)
    .fetch_one(pool)
    .await
}

/// Find a user by their unique ID.
pub async fn find_by_id(pool: &sqlx::AnyPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await
}

/// Find an active user by username.
pub async fn find_active_by_username(
    pool: &sqlx::AnyPool,
    username: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ? AND is_active = TRUE")
        .bind(username)
        .fetch_optional(pool)
        .await
}

/// Find a user by username regardless of active state.
pub async fn find_by_username(
    pool: &sqlx::AnyPool,
    username: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await
}

/// List users, newest first.
pub async fn list_users(
    pool: &sqlx::AnyPool,
    limit: i64,
    offset: i64,
) -> Result<Vec<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY created_at DESC LIMIT ? OFFSET ?")
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
}

pub async fn count_users(pool: &sqlx::AnyPool) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// Update user fields; `None` leaves a column untouched.
pub async fn update_user(
    pool: &sqlx::AnyPool,
    id: Uuid,
    username: Option<&str>,
    permissions: Option<&[String]>,
    is_active: Option<bool>,
) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        UPDATE users SET
            username = COALESCE(?, username),
            permissions = COALESCE(?, permissions),
            is_active = COALESCE(?, is_active),
            updated_at = ?
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(username)
    .bind(permissions.map(perms))
    .bind(is_active)
    .bind(ts(Utc::now()))
    .bind(id.to_string())
    .fetch_one(pool)
    .await
}

/// Delete a user. Device groups are unlinked (not deleted) in the same
/// transaction so orphaned credentials stay administrable.
pub async fn delete_user(pool: &sqlx::AnyPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE device_groups SET user_id = NULL, updated_at = ? WHERE user_id = ?")
        .bind(ts(Utc::now()))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

//! API-key repository.
//!
//! Invariant enforced here: at least one active admin key exists at all
//! times — deletion and deactivation of the final admin are refused.

use chrono::Utc;
use ukey_common::models::api_key::ApiKey;
use uuid::Uuid;

use super::{opt_ts, ts};

pub async fn create_api_key(
    pool: &sqlx::AnyPool,
    id: Uuid,
    name: &str,
    api_key: &str,
    is_admin: bool,
    expires_at: Option<chrono::DateTime<Utc>>,
) -> Result<ApiKey, sqlx::Error> {
    let now = ts(Utc::now());
    sqlx::query_as::<_, ApiKey>(
        r#"
        INSERT INTO api_keys (id, name, api_key, is_active, is_admin, expires_at, created_at, updated_at)
        VALUES (?, ?, ?, TRUE, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(id.to_string())
    .bind(name)
    .bind(api_key)
    .bind(is_admin)
    .bind(opt_ts(expires_at))
    .bind(&now)
    .bind(&now)
    .fetch_one(pool)
    .await
}

/// Resolve a presented key to its active row. Expiry is checked by the
/// caller so the 401 can distinguish nothing.
pub async fn find_active_by_key(
    pool: &sqlx::AnyPool,
    api_key: &str,
) -> Result<Option<ApiKey>, sqlx::Error> {
    sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE api_key = ? AND is_active = TRUE")
        .bind(api_key)
        .fetch_optional(pool)
        .await
}

pub async fn find_by_id(pool: &sqlx::AnyPool, id: Uuid) -> Result<Option<ApiKey>, sqlx::Error> {
    sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await
}

pub async fn list_api_keys(pool: &sqlx::AnyPool) -> Result<Vec<ApiKey>, sqlx::Error> {
    sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
}

pub async fn count_active_admin_keys(pool: &sqlx::AnyPool) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM api_keys WHERE is_admin = TRUE AND is_active = TRUE",
    )
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

pub async fn update_api_key(
    pool: &sqlx::AnyPool,
    id: Uuid,
    name: Option<&str>,
    is_active: Option<bool>,
) -> Result<Option<ApiKey>, sqlx::Error> {
    sqlx::query_as::<_, ApiKey>(
        r#"
        UPDATE api_keys SET
            name = COALESCE(?, name),
            is_active = COALESCE(?, is_active),
            updated_at = ?
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(name)
    .bind(is_active)
    .bind(ts(Utc::now()))
    .bind(id.to_string())
    .fetch_optional(pool)
    .await
}

/// Delete a key. Refuses (returns `Ok(false)` with no row change) when the
/// target is the last active admin key; the check and the delete share one
/// transaction so concurrent deletes cannot race past the invariant.
pub async fn delete_api_key(pool: &sqlx::AnyPool, id: Uuid) -> Result<DeleteOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let target = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

    let Some(target) = target else {
        return Ok(DeleteOutcome::NotFound);
    };

    if target.is_admin && target.is_active {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM api_keys WHERE is_admin = TRUE AND is_active = TRUE",
        )
        .fetch_one(&mut *tx)
        .await?;
        if row.0 <= 1 {
            return Ok(DeleteOutcome::LastAdmin);
        }
    }

    sqlx::query("DELETE FROM api_keys WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(DeleteOutcome::Deleted)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// Refused: the target is the sole active admin key.
    LastAdmin,
}

//! Auth-session repository — creation, guarded state transitions and the
//! expiry sweep.
//!
//! The conditional `UPDATE … WHERE status = ?` transitions are the
//! serialisation point for concurrent responses: whoever flips the row
//! first wins, everyone else observes zero rows affected.

use chrono::{DateTime, Utc};
use ukey_common::models::auth_session::{AuthResult, AuthSession, AuthStatus};
use ukey_common::models::user::User;
use uuid::Uuid;

use super::ts;

#[allow(clippy::too_many_arguments)]
pub async fn create_session(
    pool: &sqlx::AnyPool,
    id: Uuid,
    user_id: Uuid,
    api_key_id: Uuid,
    challenge: &str,
    action: &str,
    callback_url: Option<&str>,
    client_ip: &str,
    expires_at: DateTime<Utc>,
) -> Result<AuthSession, sqlx::Error> {
    let now = ts(Utc::now());
    sqlx::query_as::<_, AuthSession>(
        r#"
        INSERT INTO auth_sessions
            (id, user_id, api_key_id, challenge, action, status,
             callback_url, client_ip, created_at, expires_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(id.to_string())
    .bind(user_id.to_string())
    .bind(api_key_id.to_string())
    .bind(challenge)
    .bind(action)
    .bind(callback_url)
    .bind(client_ip)
    .bind(&now)
    .bind(ts(expires_at))
    .bind(&now)
    .fetch_one(pool)
    .await
}

pub async fn find_by_id(
    pool: &sqlx::AnyPool,
    id: Uuid,
) -> Result<Option<AuthSession>, sqlx::Error> {
    sqlx::query_as::<_, AuthSession>("SELECT * FROM auth_sessions WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await
}

/// Load a session together with its user (the verify path).
pub async fn find_with_user(
    pool: &sqlx::AnyPool,
    id: Uuid,
) -> Result<Option<(AuthSession, Option<User>)>, sqlx::Error> {
    let Some(session) = find_by_id(pool, id).await? else {
        return Ok(None);
    };
    let user = super::users::find_by_id(pool, session.user_id).await?;
    Ok(Some((session, user)))
}

/// Compare-and-swap the status. Returns `true` when this call performed the
/// transition, `false` when the session was not in `from` (already handled,
/// expired, or missing).
pub async fn transition(
    pool: &sqlx::AnyPool,
    id: Uuid,
    from: AuthStatus,
    to: AuthStatus,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE auth_sessions SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(ts(Utc::now()))
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

/// Drive a session to a terminal status with its result, optionally
/// stamping the responding device. Guarded against already-terminal rows so
/// a terminal session stays immutable.
pub async fn set_terminal(
    pool: &sqlx::AnyPool,
    id: Uuid,
    status: AuthStatus,
    result: AuthResult,
    responding_device_id: Option<Uuid>,
) -> Result<bool, sqlx::Error> {
    debug_assert!(status.is_terminal());
    let res = sqlx::query(
        r#"
        UPDATE auth_sessions
        SET status = ?, result = ?,
            responding_device_id = COALESCE(?, responding_device_id),
            updated_at = ?
        WHERE id = ? AND status IN ('pending', 'processing', 'processing_oncekey')
        "#,
    )
    .bind(status.as_str())
    .bind(result.as_str())
    .bind(responding_device_id.map(|d| d.to_string()))
    .bind(ts(Utc::now()))
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Record which device answered a still-live session.
pub async fn set_responding_device(
    pool: &sqlx::AnyPool,
    id: Uuid,
    device_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE auth_sessions SET responding_device_id = ?, updated_at = ?
        WHERE id = ? AND status IN ('pending', 'processing', 'processing_oncekey')
        "#,
    )
    .bind(device_id.to_string())
    .bind(ts(Utc::now()))
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Expire a single still-live session (in-band expiry check during
/// response processing and verification).
pub async fn expire_session(pool: &sqlx::AnyPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE auth_sessions SET status = 'expired', updated_at = ?
        WHERE id = ? AND status IN ('pending', 'processing', 'processing_oncekey')
        "#,
    )
    .bind(ts(Utc::now()))
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// The periodic sweep: every non-terminal session past its deadline moves
/// to Expired. Returns how many rows were swept.
pub async fn expire_overdue(pool: &sqlx::AnyPool, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE auth_sessions
        SET status = 'expired', updated_at = ?
        WHERE status IN ('pending', 'processing', 'processing_oncekey')
          AND expires_at < ?
        "#,
    )
    .bind(ts(now))
    .bind(ts(now))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Admin listing, newest first, optional status filter.
pub async fn list_sessions(
    pool: &sqlx::AnyPool,
    status: Option<AuthStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<AuthSession>, sqlx::Error> {
    sqlx::query_as::<_, AuthSession>(
        r#"
        SELECT * FROM auth_sessions
        WHERE (? IS NULL OR status = ?)
        ORDER BY created_at DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(status.map(|s| s.as_str()))
    .bind(status.map(|s| s.as_str()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

pub async fn count_sessions(
    pool: &sqlx::AnyPool,
    status: Option<AuthStatus>,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM auth_sessions WHERE (? IS NULL OR status = ?)")
            .bind(status.map(|s| s.as_str()))
            .bind(status.map(|s| s.as_str()))
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

//! Manual `sqlx::FromRow<'_, sqlx::any::AnyRow>` implementations for the
//! entity models.
//!
//! `sqlx::AnyPool` only decodes primitive types natively (i64, f64, bool,
//! String, bytes). UUID and DateTime columns must be decoded as `String` and
//! then parsed; JSON/array columns are stored as JSON text. Writing the
//! AnyRow impls by hand avoids the coherence clash a `#[derive(FromRow)]`
//! blanket impl would cause.

use chrono::{DateTime, Utc};
use sqlx::{Row, any::AnyRow};
use uuid::Uuid;

use crate::models::{
    api_key::ApiKey,
    auth_session::{AuthResult, AuthSession, AuthStatus},
    device::Device,
    device_group::DeviceGroup,
    user::User,
};

// ── Internal helpers ──────────────────────────────────────────────────────────

fn uuid(row: &AnyRow, col: &str) -> Result<Uuid, sqlx::Error> {
    let s: String = row.try_get(col)?;
    Uuid::parse_str(&s).map_err(|e| sqlx::Error::Decode(Box::new(e) as _))
}

fn opt_uuid(row: &AnyRow, col: &str) -> Result<Option<Uuid>, sqlx::Error> {
    let s: Option<String> = row.try_get(col)?;
    s.map(|v| Uuid::parse_str(&v).map_err(|e| sqlx::Error::Decode(Box::new(e) as _)))
        .transpose()
}

fn dt(row: &AnyRow, col: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let s: String = row.try_get(col)?;
    parse_dt(&s).map_err(sqlx::Error::Decode)
}

fn opt_dt(row: &AnyRow, col: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let s: Option<String> = row.try_get(col)?;
    s.map(|v| parse_dt(&v).map_err(sqlx::Error::Decode)).transpose()
}

fn parse_dt(
    s: &str,
) -> Result<DateTime<Utc>, Box<dyn std::error::Error + Send + Sync + 'static>> {
    // Postgres via the Any text protocol sends RFC 3339
    if let Ok(d) = DateTime::parse_from_rfc3339(s) {
        return Ok(d.with_timezone(&Utc));
    }
    // SQLite CURRENT_TIMESTAMP: "YYYY-MM-DD HH:MM:SS", optionally fractional
    if let Ok(d) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(d.and_utc());
    }
    if let Ok(d) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(d.and_utc());
    }
    Err(format!("cannot parse timestamp '{s}'").into())
}

fn str_vec(row: &AnyRow, col: &str) -> Result<Vec<String>, sqlx::Error> {
    let s: String = row.try_get(col)?;
    if s.trim() == "[]" || s.is_empty() {
        return Ok(vec![]);
    }
    serde_json::from_str(&s).map_err(|e| sqlx::Error::Decode(Box::new(e) as _))
}

fn parse_enum<T>(
    row: &AnyRow,
    col: &str,
    f: impl Fn(&str) -> Option<T>,
) -> Result<T, sqlx::Error> {
    let s: String = row.try_get(col)?;
    f(&s).ok_or_else(|| sqlx::Error::Decode(format!("unknown enum variant: {s}").into()))
}

fn opt_enum<T>(
    row: &AnyRow,
    col: &str,
    f: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, sqlx::Error> {
    let s: Option<String> = row.try_get(col)?;
    match s {
        Some(v) if !v.is_empty() => f(&v)
            .map(Some)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown enum variant: {v}").into())),
        _ => Ok(None),
    }
}

// ── User ──────────────────────────────────────────────────────────────────────

impl<'r> sqlx::FromRow<'r, AnyRow> for User {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(User {
            id: uuid(row, "id")?,
            username: row.try_get("username")?,
            permissions: str_vec(row, "permissions")?,
            is_active: row.try_get("is_active")?,
            created_at: dt(row, "created_at")?,
            updated_at: dt(row, "updated_at")?,
        })
    }
}

// ── DeviceGroup ───────────────────────────────────────────────────────────────

impl<'r> sqlx::FromRow<'r, AnyRow> for DeviceGroup {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(DeviceGroup {
            id: uuid(row, "id")?,
            user_id: opt_uuid(row, "user_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            permissions: str_vec(row, "permissions")?,
            totp_secret_uri: row.try_get("totp_secret_uri")?,
            once_key: row.try_get("once_key")?,
            last_used_once_key: row.try_get("last_used_once_key")?,
            is_active: row.try_get("is_active")?,
            created_at: dt(row, "created_at")?,
            updated_at: dt(row, "updated_at")?,
        })
    }
}

// ── Device ────────────────────────────────────────────────────────────────────

impl<'r> sqlx::FromRow<'r, AnyRow> for Device {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Device {
            id: uuid(row, "id")?,
            device_group_id: opt_uuid(row, "device_group_id")?,
            name: row.try_get("name")?,
            serial_number: row.try_get("serial_number")?,
            volume_serial_number: row.try_get("volume_serial_number")?,
            vendor: row.try_get("vendor")?,
            model: row.try_get("model")?,
            remark: row.try_get("remark")?,
            is_active: row.try_get("is_active")?,
            is_online: row.try_get("is_online")?,
            last_heartbeat: opt_dt(row, "last_heartbeat")?,
            last_online_at: opt_dt(row, "last_online_at")?,
            last_offline_at: opt_dt(row, "last_offline_at")?,
            created_at: dt(row, "created_at")?,
            updated_at: dt(row, "updated_at")?,
        })
    }
}

// ── ApiKey ────────────────────────────────────────────────────────────────────

impl<'r> sqlx::FromRow<'r, AnyRow> for ApiKey {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(ApiKey {
            id: uuid(row, "id")?,
            name: row.try_get("name")?,
            api_key: row.try_get("api_key")?,
            is_active: row.try_get("is_active")?,
            is_admin: row.try_get("is_admin")?,
            expires_at: opt_dt(row, "expires_at")?,
            created_at: dt(row, "created_at")?,
            updated_at: dt(row, "updated_at")?,
        })
    }
}

// ── AuthSession ───────────────────────────────────────────────────────────────

impl<'r> sqlx::FromRow<'r, AnyRow> for AuthSession {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(AuthSession {
            id: uuid(row, "id")?,
            user_id: uuid(row, "user_id")?,
            api_key_id: uuid(row, "api_key_id")?,
            responding_device_id: opt_uuid(row, "responding_device_id")?,
            challenge: row.try_get("challenge")?,
            action: row.try_get("action")?,
            status: parse_enum(row, "status", AuthStatus::from_str)?,
            result: opt_enum(row, "result", AuthResult::from_str)?,
            callback_url: row.try_get("callback_url")?,
            client_ip: row.try_get("client_ip")?,
            created_at: dt(row, "created_at")?,
            expires_at: dt(row, "expires_at")?,
            updated_at: dt(row, "updated_at")?,
        })
    }
}

//! Repository layer — every durable read/write the server performs.
//!
//! All functions take the pool (or an open transaction) explicitly; nothing
//! here holds state. Timestamps are written as RFC 3339 text so the same SQL
//! runs on both backends.

pub mod api_keys;
pub mod auth_sessions;
pub mod device_groups;
pub mod devices;
pub mod users;

use chrono::{DateTime, Utc};

/// Canonical column encoding for timestamps.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

/// Canonical column encoding for optional timestamps.
pub(crate) fn opt_ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(ts)
}

/// Canonical column encoding for permission lists.
pub(crate) fn perms(p: &[String]) -> String {
    serde_json::to_string(p).expect("string lists serialize infallibly")
}

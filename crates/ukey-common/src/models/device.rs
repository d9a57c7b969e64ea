//! Device — a physical USB medium identified by its serial pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,

    /// Owning group; `None` only between init and first grouping.
    pub device_group_id: Option<Uuid>,

    pub name: String,

    /// Hardware serial reported by the client. Unique.
    pub serial_number: String,

    /// Volume serial of the medium. Unique.
    pub volume_serial_number: String,

    pub vendor: String,
    pub model: String,
    pub remark: String,

    /// Admin switch — only active devices receive authentication requests.
    pub is_active: bool,

    /// Runtime presence, owned by the hub and mirrored here best-effort by
    /// the status synchroniser.
    pub is_online: bool,

    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_online_at: Option<DateTime<Utc>>,
    pub last_offline_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateDeviceRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: Option<String>,
    pub remark: Option<String>,
    pub is_active: Option<bool>,
}

/// A presence change headed for durable storage. Produced by the hub,
/// coalesced and flushed by the status synchroniser — the sole writer of
/// the columns it touches.
#[derive(Debug, Clone)]
pub struct DeviceStatusUpdate {
    pub device_id: Uuid,
    pub is_online: Option<bool>,
    pub last_online_at: Option<DateTime<Utc>>,
    pub last_offline_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl DeviceStatusUpdate {
    /// Presence flip: online also stamps last_online_at and a heartbeat,
    /// offline stamps last_offline_at.
    pub fn presence(device_id: Uuid, is_online: bool) -> Self {
        let now = Utc::now();
        Self {
            device_id,
            is_online: Some(is_online),
            last_online_at: is_online.then_some(now),
            last_offline_at: (!is_online).then_some(now),
            last_heartbeat: is_online.then_some(now),
            at: now,
        }
    }

    /// Heartbeat refresh for a device already online.
    pub fn heartbeat(device_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            device_id,
            is_online: Some(true),
            last_online_at: None,
            last_offline_at: None,
            last_heartbeat: Some(now),
            at: now,
        }
    }

    /// Fold a newer update into this one, field by field.
    pub fn merge(&mut self, newer: &DeviceStatusUpdate) {
        if newer.is_online.is_some() {
            self.is_online = newer.is_online;
        }
        if newer.last_online_at.is_some() {
            self.last_online_at = newer.last_online_at;
        }
        if newer.last_offline_at.is_some() {
            self.last_offline_at = newer.last_offline_at;
        }
        if newer.last_heartbeat.is_some() {
            self.last_heartbeat = newer.last_heartbeat;
        }
        self.at = newer.at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_online_stamps_heartbeat() {
        let u = DeviceStatusUpdate::presence(Uuid::nil(), true);
        assert_eq!(u.is_online, Some(true));
        assert!(u.last_online_at.is_some());
        assert!(u.last_heartbeat.is_some());
        assert!(u.last_offline_at.is_none());
    }

    #[test]
    fn presence_offline_stamps_offline_time() {
        let u = DeviceStatusUpdate::presence(Uuid::nil(), false);
        assert_eq!(u.is_online, Some(false));
        assert!(u.last_offline_at.is_some());
        assert!(u.last_online_at.is_none());
    }

    #[test]
    fn merge_keeps_earlier_fields_the_newer_update_omits() {
        let mut base = DeviceStatusUpdate::presence(Uuid::nil(), true);
        let online_at = base.last_online_at;

        let hb = DeviceStatusUpdate::heartbeat(Uuid::nil());
        base.merge(&hb);

        assert_eq!(base.is_online, Some(true));
        assert_eq!(base.last_online_at, online_at);
        assert_eq!(base.last_heartbeat, hb.last_heartbeat);
    }

    #[test]
    fn merge_overwrites_presence_flips() {
        let mut base = DeviceStatusUpdate::presence(Uuid::nil(), true);
        let off = DeviceStatusUpdate::presence(Uuid::nil(), false);
        base.merge(&off);
        assert_eq!(base.is_online, Some(false));
        assert!(base.last_offline_at.is_some());
    }
}

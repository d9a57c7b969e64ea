//! Connection-hub handle.
//!
//! The hub is process-wide state owned by the gateway. Everything else —
//! the coordinator, the admin routes — talks to it through this trait so
//! tests can substitute a fake. All methods are synchronous: map reads go
//! through an RW lock, sends are non-blocking enqueues onto each
//! connection's bounded outbound queue.

use uuid::Uuid;

use crate::messages::WsEnvelope;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("user {0} is not online")]
    UserOffline(Uuid),
    #[error("device {0} is not online")]
    DeviceOffline(Uuid),
    #[error("outbound queue full")]
    QueueFull,
    #[error("failed to seal outbound frame")]
    Sealing,
}

/// The hub contract used by the coordinator and the admin surface.
pub trait DeviceHub: Send + Sync {
    fn is_device_online(&self, device_id: Uuid) -> bool;

    fn is_user_online(&self, user_id: Uuid) -> bool;

    /// Enqueue an envelope for the user's live session. Sealed transparently
    /// when the session's handshake is complete.
    fn send_to_user(&self, user_id: Uuid, envelope: WsEnvelope) -> Result<(), HubError>;

    /// Enqueue an envelope for a device's live session.
    fn send_to_device(&self, device_id: Uuid, envelope: WsEnvelope) -> Result<(), HubError>;

    /// Rebind an online device to a user, evicting any session the user
    /// holds on a different device. Idempotent when already bound.
    fn link_device_to_user(&self, device_id: Uuid, user_id: Uuid) -> Result<(), HubError>;

    /// Presence bookkeeping on connect — delegates to the status synchroniser.
    fn on_device_connect(&self, device_id: Uuid);

    /// Force-close a device's connection if present, then mark it offline.
    fn on_device_disconnect(&self, device_id: Uuid);

    /// Fan an envelope out to every connected session (admin status sweep).
    fn broadcast(&self, envelope: WsEnvelope);

    /// Snapshot of every device id with a live session.
    fn online_device_ids(&self) -> Vec<Uuid>;

    fn online_device_count(&self) -> usize {
        self.online_device_ids().len()
    }
}

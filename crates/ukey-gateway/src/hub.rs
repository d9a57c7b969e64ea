//! Connection hub — the process-wide registry of live device sessions.
//!
//! Three maps behind one RW lock: all sessions, sessions by device id, and
//! sessions by user id. Register/unregister flow through a command channel
//! so every pair observes a total order; reads are concurrent. The user map
//! enforces the single-session policy: a new registration for an occupied
//! slot evicts the incumbent with a `force_logout` frame, a one-second
//! grace, then a close.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use ukey_common::hub::{DeviceHub, HubError};
use ukey_common::messages::{self, ForceLogout, WsEnvelope};

use crate::session::ClientSession;
use crate::status_sync::StatusSyncHandle;

/// Grace period between the `force_logout` frame and the socket close.
const FORCE_LOGOUT_GRACE: Duration = Duration::from_secs(1);

pub enum HubCommand {
    Register(Arc<ClientSession>),
    Unregister(Arc<ClientSession>),
    /// Fan an envelope out to every connected session.
    Broadcast(WsEnvelope),
}

#[derive(Default)]
struct Registry {
    clients: HashMap<Uuid, Arc<ClientSession>>,
    device_clients: HashMap<Uuid, Arc<ClientSession>>,
    user_clients: HashMap<Uuid, Arc<ClientSession>>,
}

pub struct ConnectionHub {
    inner: RwLock<Registry>,
    cmd_tx: mpsc::UnboundedSender<HubCommand>,
    status_sync: StatusSyncHandle,
}

impl ConnectionHub {
    /// Create the hub and the command stream its serialiser task consumes.
    pub fn new(
        status_sync: StatusSyncHandle,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HubCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            inner: RwLock::new(Registry::default()),
            cmd_tx,
            status_sync,
        });
        (hub, cmd_rx)
    }

    /// The serialiser: applies commands in arrival order.
    pub async fn run(self: Arc<Self>, mut cmd_rx: mpsc::UnboundedReceiver<HubCommand>) {
        tracing::info!("Connection hub running");
        while let Some(command) = cmd_rx.recv().await {
            match command {
                HubCommand::Register(session) => self.register_session(session),
                HubCommand::Unregister(session) => self.unregister_session(session),
                HubCommand::Broadcast(envelope) => self.broadcast(envelope),
            }
        }
        tracing::info!("Connection hub stopped");
    }

    /// Enqueue a registration (called once a connection has an identity).
    pub fn register(&self, session: Arc<ClientSession>) {
        let _ = self.cmd_tx.send(HubCommand::Register(session));
    }

    /// Enqueue an unregistration (connection teardown).
    pub fn unregister(&self, session: Arc<ClientSession>) {
        let _ = self.cmd_tx.send(HubCommand::Unregister(session));
    }

    /// Record a heartbeat for the session's device.
    pub fn heartbeat(&self, session: &ClientSession) {
        if let Some(device_id) = session.device_id() {
            self.status_sync.heartbeat(device_id);
        }
    }

    fn register_session(&self, session: Arc<ClientSession>) {
        let mut registry = self.inner.write().unwrap();

        if let Some(user_id) = session.user_id() {
            if let Some(existing) = registry.user_clients.get(&user_id) {
                if !Arc::ptr_eq(existing, &session) {
                    tracing::warn!(user_id = %user_id,
                        old_device = ?existing.device_id(),
                        new_device = ?session.device_id(),
                        "Duplicate user session — evicting the incumbent");
                    self.force_close(existing.clone());
                }
            }
            registry.user_clients.insert(user_id, session.clone());
        }

        if let Some(device_id) = session.device_id() {
            registry.device_clients.insert(device_id, session.clone());
            self.status_sync.device_status(device_id, true);
        }

        registry.clients.insert(session.id, session.clone());

        tracing::info!(session_id = %session.id,
            device_id = ?session.device_id(),
            user_id = ?session.user_id(),
            serial = %session.serial_number(),
            "Client registered");
    }

    fn unregister_session(&self, session: Arc<ClientSession>) {
        let mut registry = self.inner.write().unwrap();

        if registry.clients.remove(&session.id).is_none() {
            return; // never registered or already gone
        }

        // Only clear the keyed slots when they still point at this session;
        // a quick reconnect may have overwritten them already.
        if let Some(user_id) = session.user_id() {
            if registry
                .user_clients
                .get(&user_id)
                .is_some_and(|c| Arc::ptr_eq(c, &session))
            {
                registry.user_clients.remove(&user_id);
            }
        }

        if let Some(device_id) = session.device_id() {
            if registry
                .device_clients
                .get(&device_id)
                .is_some_and(|c| Arc::ptr_eq(c, &session))
            {
                registry.device_clients.remove(&device_id);
                self.status_sync.device_status(device_id, false);
            }
        }

        session.close();

        tracing::info!(session_id = %session.id,
            device_id = ?session.device_id(),
            user_id = ?session.user_id(),
            duration = ?(chrono::Utc::now() - session.connected_at),
            "Client unregistered");
    }

    fn broadcast(&self, envelope: WsEnvelope) {
        let registry = self.inner.read().unwrap();
        for session in registry.clients.values() {
            if let Err(e) = session.enqueue(&envelope) {
                tracing::warn!(session_id = %session.id, error = %e,
                    "broadcast enqueue failed");
            }
        }
    }

    /// Cooperative eviction: `force_logout`, one second of grace, close,
    /// then unregister.
    fn force_close(&self, session: Arc<ClientSession>) {
        let envelope = WsEnvelope::new(
            messages::types::FORCE_LOGOUT,
            &ForceLogout { message: "signed in from another session".into() },
        );
        let delivered = session.enqueue(&envelope).is_ok();

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            if delivered {
                tokio::time::sleep(FORCE_LOGOUT_GRACE).await;
            }
            session.close();
            let _ = cmd_tx.send(HubCommand::Unregister(session));
        });
    }

    fn get_device_session(&self, device_id: Uuid) -> Option<Arc<ClientSession>> {
        self.inner
            .read()
            .unwrap()
            .device_clients
            .get(&device_id)
            .cloned()
    }

    fn get_user_session(&self, user_id: Uuid) -> Option<Arc<ClientSession>> {
        self.inner.read().unwrap().user_clients.get(&user_id).cloned()
    }
}

impl DeviceHub for ConnectionHub {
    fn is_device_online(&self, device_id: Uuid) -> bool {
        self.inner
            .read()
            .unwrap()
            .device_clients
            .contains_key(&device_id)
    }

    fn is_user_online(&self, user_id: Uuid) -> bool {
        self.inner.read().unwrap().user_clients.contains_key(&user_id)
    }

    fn send_to_user(&self, user_id: Uuid, envelope: WsEnvelope) -> Result<(), HubError> {
        let session = self
            .get_user_session(user_id)
            .ok_or(HubError::UserOffline(user_id))?;
        session.enqueue(&envelope)
    }

    fn send_to_device(&self, device_id: Uuid, envelope: WsEnvelope) -> Result<(), HubError> {
        let session = self
            .get_device_session(device_id)
            .ok_or(HubError::DeviceOffline(device_id))?;
        session.enqueue(&envelope)
    }

    fn link_device_to_user(&self, device_id: Uuid, user_id: Uuid) -> Result<(), HubError> {
        let mut registry = self.inner.write().unwrap();

        let session = registry
            .device_clients
            .get(&device_id)
            .cloned()
            .ok_or(HubError::DeviceOffline(device_id))?;

        if session.user_id() == Some(user_id) {
            return Ok(()); // already bound
        }

        // Single-session policy: evict the user's session on any other device.
        if let Some(existing) = registry.user_clients.get(&user_id).cloned() {
            if existing.device_id() != Some(device_id) {
                tracing::info!(user_id = %user_id,
                    old_device = ?existing.device_id(), new_device = %device_id,
                    "User already connected elsewhere — evicting");
                self.force_close(existing);
            }
        }

        // Drop this device's previous user binding.
        if let Some(previous_user) = session.user_id() {
            if registry
                .user_clients
                .get(&previous_user)
                .is_some_and(|c| Arc::ptr_eq(c, &session))
            {
                registry.user_clients.remove(&previous_user);
            }
        }

        session.set_user(Some(user_id));
        registry.user_clients.insert(user_id, session);

        tracing::info!(user_id = %user_id, device_id = %device_id,
            "Linked online device to user");
        Ok(())
    }

    fn broadcast(&self, envelope: WsEnvelope) {
        let _ = self.cmd_tx.send(HubCommand::Broadcast(envelope));
    }

    fn on_device_connect(&self, device_id: Uuid) {
        self.status_sync.device_status(device_id, true);
    }

    fn on_device_disconnect(&self, device_id: Uuid) {
        match self.get_device_session(device_id) {
            Some(session) => {
                self.force_close(session);
            }
            None => {
                tracing::info!(device_id = %device_id,
                    "device not connected, presence update only");
            }
        }
        self.status_sync.device_status(device_id, false);
    }

    fn online_device_ids(&self) -> Vec<Uuid> {
        self.inner
            .read()
            .unwrap()
            .device_clients
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outbound;
    use crate::status_sync::StatusSync;
    use ukey_common::ids;
    use ukey_db::{Database, DbBackend};

    async fn test_hub() -> (Arc<ConnectionHub>, tokio::task::JoinHandle<()>) {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Database { pool, backend: DbBackend::Sqlite };
        db.migrate().await.unwrap();

        let (status_sync, _task) =
            StatusSync::spawn(db, 100, Duration::from_millis(50), 16);
        let (hub, cmd_rx) = ConnectionHub::new(status_sync);
        let run = tokio::spawn(hub.clone().run(cmd_rx));
        (hub, run)
    }

    fn connected_session(
        device_id: Uuid,
        user_id: Option<Uuid>,
    ) -> (Arc<ClientSession>, tokio::sync::mpsc::Receiver<Outbound>) {
        let (session, rx) = ClientSession::new(16);
        session.set_device(device_id, "SN", "VSN");
        session.set_user(user_id);
        (session, rx)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn register_makes_device_and_user_online() {
        let (hub, _run) = test_hub().await;
        let device_id = ids::generate_id();
        let user_id = ids::generate_id();

        let (session, _rx) = connected_session(device_id, Some(user_id));
        hub.register(session);
        settle().await;

        assert!(hub.is_device_online(device_id));
        assert!(hub.is_user_online(user_id));
        assert_eq!(hub.online_device_ids(), vec![device_id]);
    }

    #[tokio::test]
    async fn unregister_clears_presence() {
        let (hub, _run) = test_hub().await;
        let device_id = ids::generate_id();
        let user_id = ids::generate_id();

        let (session, _rx) = connected_session(device_id, Some(user_id));
        hub.register(session.clone());
        settle().await;

        hub.unregister(session);
        settle().await;

        assert!(!hub.is_device_online(device_id));
        assert!(!hub.is_user_online(user_id));
    }

    #[tokio::test]
    async fn duplicate_user_registration_evicts_incumbent() {
        let (hub, _run) = test_hub().await;
        let user_id = ids::generate_id();
        let device_a = ids::generate_id();
        let device_b = ids::generate_id();

        let (first, mut first_rx) = connected_session(device_a, Some(user_id));
        hub.register(first);
        settle().await;

        let (second, _rx) = connected_session(device_b, Some(user_id));
        hub.register(second.clone());
        settle().await;

        // The incumbent got the force_logout frame…
        let Outbound::Frame(text) = first_rx.recv().await.unwrap() else {
            panic!("expected force_logout frame");
        };
        let env = WsEnvelope::from_bytes(text.as_bytes()).unwrap();
        assert_eq!(env.msg_type, "force_logout");

        // …then, after the grace period, the close.
        tokio::time::sleep(FORCE_LOGOUT_GRACE + Duration::from_millis(200)).await;
        assert!(matches!(first_rx.recv().await, Some(Outbound::Close)));

        // The user slot now belongs to the new session.
        assert!(hub.is_user_online(user_id));
        assert!(hub.is_device_online(device_b));
        hub.send_to_user(user_id, WsEnvelope::new(
            messages::types::DEVICE_STATUS_CHECK,
            &messages::DeviceStatusCheck { timestamp: chrono::Utc::now() },
        ))
        .unwrap();
        assert_eq!(second.user_id(), Some(user_id));
    }

    #[tokio::test]
    async fn link_device_to_user_rebinds_and_evicts() {
        let (hub, _run) = test_hub().await;
        let user_id = ids::generate_id();
        let device_a = ids::generate_id();
        let device_b = ids::generate_id();

        let (on_a, mut a_rx) = connected_session(device_a, Some(user_id));
        hub.register(on_a);
        settle().await;

        // Device B online with no user yet.
        let (on_b, _b_rx) = connected_session(device_b, None);
        hub.register(on_b.clone());
        settle().await;

        hub.link_device_to_user(device_b, user_id).unwrap();
        settle().await;

        let Outbound::Frame(text) = a_rx.recv().await.unwrap() else {
            panic!("expected force_logout frame");
        };
        assert_eq!(
            WsEnvelope::from_bytes(text.as_bytes()).unwrap().msg_type,
            "force_logout"
        );

        assert_eq!(on_b.user_id(), Some(user_id));
        assert!(hub.is_user_online(user_id));

        // Linking again is a no-op.
        hub.link_device_to_user(device_b, user_id).unwrap();
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connected_session() {
        let (hub, _run) = test_hub().await;
        let (first, mut first_rx) = connected_session(ids::generate_id(), None);
        let (second, mut second_rx) = connected_session(ids::generate_id(), None);
        hub.register(first);
        hub.register(second);
        settle().await;

        hub.broadcast(WsEnvelope::new(
            messages::types::DEVICE_STATUS_CHECK,
            &messages::DeviceStatusCheck { timestamp: chrono::Utc::now() },
        ));
        settle().await;

        for rx in [&mut first_rx, &mut second_rx] {
            let Some(Outbound::Frame(text)) = rx.recv().await else {
                panic!("expected broadcast frame");
            };
            let env = WsEnvelope::from_bytes(text.as_bytes()).unwrap();
            assert_eq!(env.msg_type, "device_status_check");
        }
    }

    #[tokio::test]
    async fn link_requires_online_device() {
        let (hub, _run) = test_hub().await;
        let err = hub
            .link_device_to_user(ids::generate_id(), ids::generate_id())
            .unwrap_err();
        assert!(matches!(err, HubError::DeviceOffline(_)));
    }

    #[tokio::test]
    async fn send_to_offline_user_errors() {
        let (hub, _run) = test_hub().await;
        let err = hub
            .send_to_user(
                ids::generate_id(),
                WsEnvelope::new(
                    messages::types::PING,
                    &messages::Ping { timestamp: chrono::Utc::now() },
                ),
            )
            .unwrap_err();
        assert!(matches!(err, HubError::UserOffline(_)));
    }
}

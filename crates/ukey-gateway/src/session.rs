//! Per-connection session state.
//!
//! A `ClientSession` is shared between the reader task, the writer task and
//! the hub. The handshake transition plus encryptor install is a brief
//! atomic update, so a mutex guards it; identity fields sit behind their
//! own RW lock. The outbound path is a bounded queue drained by the writer.

use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use ukey_common::crypto::Encryptor;
use ukey_common::hub::HubError;
use ukey_common::ids;
use ukey_common::messages::{self, EncryptedPayload, HandshakeStatus, WsEnvelope};

/// What travels through a session's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    /// A serialized frame, sealed already if the handshake is complete.
    Frame(String),
    /// Write a close frame and end the connection.
    Close,
}

#[derive(Debug, Default, Clone)]
struct Identity {
    device_id: Option<Uuid>,
    user_id: Option<Uuid>,
    serial_number: String,
    volume_serial_number: String,
}

struct Handshake {
    status: HandshakeStatus,
    encryptor: Option<Encryptor>,
}

pub struct ClientSession {
    pub id: Uuid,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<Outbound>,
    identity: RwLock<Identity>,
    handshake: Mutex<Handshake>,
    last_pong: Mutex<DateTime<Utc>>,
}

impl ClientSession {
    /// Create a session and the receiver half of its outbound queue.
    pub fn new(queue_depth: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        let session = Arc::new(Self {
            id: ids::generate_id(),
            connected_at: Utc::now(),
            tx,
            identity: RwLock::new(Identity::default()),
            handshake: Mutex::new(Handshake {
                status: HandshakeStatus::Pending,
                encryptor: None,
            }),
            last_pong: Mutex::new(Utc::now()),
        });
        (session, rx)
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    pub fn device_id(&self) -> Option<Uuid> {
        self.identity.read().unwrap().device_id
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.identity.read().unwrap().user_id
    }

    pub fn serial_number(&self) -> String {
        self.identity.read().unwrap().serial_number.clone()
    }

    pub fn set_device(&self, device_id: Uuid, serial: &str, volume_serial: &str) {
        let mut identity = self.identity.write().unwrap();
        identity.device_id = Some(device_id);
        identity.serial_number = serial.to_owned();
        identity.volume_serial_number = volume_serial.to_owned();
    }

    pub fn set_user(&self, user_id: Option<Uuid>) {
        self.identity.write().unwrap().user_id = user_id;
    }

    // ── Handshake ────────────────────────────────────────────────────────────

    pub fn handshake_status(&self) -> HandshakeStatus {
        self.handshake.lock().unwrap().status
    }

    /// Install the session key and move to Completed.
    pub fn complete_handshake(&self, encryptor: Encryptor) {
        let mut hs = self.handshake.lock().unwrap();
        hs.encryptor = Some(encryptor);
        hs.status = HandshakeStatus::Completed;
    }

    pub fn fail_handshake(&self) {
        self.handshake.lock().unwrap().status = HandshakeStatus::Failed;
    }

    // ── Liveness ─────────────────────────────────────────────────────────────

    pub fn touch_pong(&self) {
        *self.last_pong.lock().unwrap() = Utc::now();
    }

    /// Stamp of the most recent liveness token from the peer.
    pub fn last_pong(&self) -> DateTime<Utc> {
        *self.last_pong.lock().unwrap()
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Enqueue an envelope, sealing it when the handshake is complete.
    pub fn enqueue(&self, envelope: &WsEnvelope) -> Result<(), HubError> {
        let sealed = {
            let hs = self.handshake.lock().unwrap();
            match (&hs.status, &hs.encryptor) {
                (HandshakeStatus::Completed, Some(encryptor)) => {
                    let (payload, nonce) = encryptor
                        .seal(&envelope.to_bytes())
                        .map_err(|_| HubError::Sealing)?;
                    WsEnvelope::new(
                        messages::types::ENCRYPTED,
                        &EncryptedPayload { payload, nonce },
                    )
                }
                _ => envelope.clone(),
            }
        };
        self.enqueue_text(serde_json::to_string(&sealed).expect("envelope serializes"))
    }

    /// Enqueue without sealing — only the `key_exchange_response` uses this.
    pub fn enqueue_unsealed(&self, envelope: &WsEnvelope) -> Result<(), HubError> {
        self.enqueue_text(serde_json::to_string(envelope).expect("envelope serializes"))
    }

    fn enqueue_text(&self, text: String) -> Result<(), HubError> {
        self.tx
            .try_send(Outbound::Frame(text))
            .map_err(|_| HubError::QueueFull)
    }

    /// Ask the writer to close the connection. Best-effort.
    pub fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }

    /// Open a sealed inbound frame with this session's key.
    pub fn open_frame(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, HubError> {
        let hs = self.handshake.lock().unwrap();
        let encryptor = hs.encryptor.as_ref().ok_or(HubError::Sealing)?;
        encryptor
            .open(&payload.payload, &payload.nonce)
            .map_err(|_| HubError::Sealing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ukey_common::messages::Ping;

    #[test]
    fn enqueue_plaintext_before_handshake() {
        let (session, mut rx) = ClientSession::new(4);
        let env = WsEnvelope::new(messages::types::PING, &Ping { timestamp: Utc::now() });
        session.enqueue(&env).unwrap();

        let Outbound::Frame(text) = rx.try_recv().unwrap() else {
            panic!("expected a frame");
        };
        let parsed = WsEnvelope::from_bytes(text.as_bytes()).unwrap();
        assert_eq!(parsed.msg_type, "ping");
    }

    #[test]
    fn enqueue_seals_after_handshake() {
        let (session, mut rx) = ClientSession::new(4);
        session.complete_handshake(Encryptor::new([9u8; 32]));
        assert_eq!(session.handshake_status(), HandshakeStatus::Completed);

        let env = WsEnvelope::new(messages::types::PING, &Ping { timestamp: Utc::now() });
        session.enqueue(&env).unwrap();

        let Outbound::Frame(text) = rx.try_recv().unwrap() else {
            panic!("expected a frame");
        };
        let outer = WsEnvelope::from_bytes(text.as_bytes()).unwrap();
        assert_eq!(outer.msg_type, "encrypted");

        let sealed: EncryptedPayload = outer.parse().unwrap();
        let inner_bytes = session.open_frame(&sealed).unwrap();
        let inner = WsEnvelope::from_bytes(&inner_bytes).unwrap();
        assert_eq!(inner.msg_type, "ping");
    }

    #[test]
    fn bounded_queue_rejects_overflow() {
        let (session, _rx) = ClientSession::new(1);
        let env = WsEnvelope::new(messages::types::PING, &Ping { timestamp: Utc::now() });
        session.enqueue(&env).unwrap();
        assert!(matches!(session.enqueue(&env), Err(HubError::QueueFull)));
    }
}

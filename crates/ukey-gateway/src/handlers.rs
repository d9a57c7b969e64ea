//! Inbound frame dispatch.
//!
//! The outer layer enforces the handshake protocol: a pending session may
//! only negotiate keys, a completed session may only speak `encrypted`.
//! Decrypted inner envelopes land in `dispatch_inner`, which fans out to
//! the device lifecycle and authentication handlers.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use ukey_common::crypto::{EcdhKeyPair, Encryptor};
use ukey_common::ids;
use ukey_common::messages::{
    self, AuthResponse, DeviceConnection, DeviceConnectionResponse, DeviceInitRequest,
    DeviceInitResponse, EncryptedPayload, ErrorMessage, HandshakeStatus, KeyExchangeRequest,
    KeyExchangeResponse, OnceKeyUpdateConfirm, WsEnvelope, connection_status,
};
use ukey_common::models::device::Device;
use ukey_common::models::device_group::DeviceGroup;
use ukey_common::totp;
use ukey_db::repository::{device_groups, devices};

use crate::GatewayState;
use crate::session::ClientSession;

/// Whether the connection survives the frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Handle one validated outer envelope.
pub async fn dispatch(
    state: &GatewayState,
    session: &Arc<ClientSession>,
    envelope: WsEnvelope,
) -> Flow {
    match session.handshake_status() {
        HandshakeStatus::Pending => {
            if envelope.msg_type == messages::types::KEY_EXCHANGE_REQUEST {
                handle_key_exchange(session, &envelope)
            } else {
                send_error(
                    session,
                    &envelope.msg_type,
                    "handshake_required",
                    "key exchange must complete first",
                );
                Flow::Close
            }
        }
        HandshakeStatus::Completed => {
            if envelope.msg_type == messages::types::ENCRYPTED {
                handle_encrypted(state, session, &envelope).await
            } else {
                // Plaintext after the handshake is a protocol violation.
                send_error(
                    session,
                    &envelope.msg_type,
                    "encryption_required",
                    "plaintext frame received after handshake",
                );
                Flow::Close
            }
        }
        HandshakeStatus::Failed => Flow::Close,
    }
}

// ── Handshake ────────────────────────────────────────────────────────────────

fn handle_key_exchange(session: &Arc<ClientSession>, envelope: &WsEnvelope) -> Flow {
    let request: KeyExchangeRequest = match envelope.parse() {
        Ok(r) => r,
        Err(e) => {
            send_error(session, &envelope.msg_type, "parse_error", &e.to_string());
            return Flow::Close;
        }
    };

    let keypair = EcdhKeyPair::generate();
    let shared = match keypair.compute_shared(&request.public_key) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(session_id = %session.id, error = %e, "Key exchange failed");
            session.fail_handshake();
            let _ = session.enqueue_unsealed(&WsEnvelope::new(
                messages::types::KEY_EXCHANGE_RESPONSE,
                &KeyExchangeResponse {
                    public_key: String::new(),
                    success: false,
                    error: Some(e.to_string()),
                },
            ));
            return Flow::Close;
        }
    };

    session.complete_handshake(Encryptor::new(shared));

    // The response itself travels unencrypted — the peer derives the same
    // key from our public half.
    let response = WsEnvelope::new(
        messages::types::KEY_EXCHANGE_RESPONSE,
        &KeyExchangeResponse {
            public_key: keypair.public_key_base64(),
            success: true,
            error: None,
        },
    );
    if session.enqueue_unsealed(&response).is_err() {
        return Flow::Close;
    }

    tracing::info!(session_id = %session.id, "Handshake completed");
    Flow::Continue
}

async fn handle_encrypted(
    state: &GatewayState,
    session: &Arc<ClientSession>,
    envelope: &WsEnvelope,
) -> Flow {
    let sealed: EncryptedPayload = match envelope.parse() {
        Ok(p) => p,
        Err(e) => {
            send_error(session, messages::types::ENCRYPTED, "parse_error", &e.to_string());
            return Flow::Close;
        }
    };

    let plain = match session.open_frame(&sealed) {
        Ok(p) => p,
        Err(_) => {
            send_error(
                session,
                messages::types::ENCRYPTED,
                "decrypt_error",
                "failed to decrypt frame",
            );
            return Flow::Close;
        }
    };

    let inner = match WsEnvelope::from_bytes(&plain) {
        Ok(env) => env,
        Err(e) => {
            send_error(session, messages::types::ENCRYPTED, "parse_error", &e.to_string());
            return Flow::Close;
        }
    };

    if inner.msg_type == messages::types::ENCRYPTED {
        send_error(
            session,
            messages::types::ENCRYPTED,
            "protocol_error",
            "nested encrypted frame",
        );
        return Flow::Close;
    }

    dispatch_inner(state, session, inner).await
}

// ── Inner dispatch ───────────────────────────────────────────────────────────

async fn dispatch_inner(
    state: &GatewayState,
    session: &Arc<ClientSession>,
    envelope: WsEnvelope,
) -> Flow {
    match envelope.msg_type.as_str() {
        messages::types::DEVICE_INIT_REQUEST => handle_device_init(state, session, &envelope).await,
        messages::types::DEVICE_CONNECTION => {
            handle_device_connection(state, session, &envelope, true).await
        }
        messages::types::DEVICE_RECONNECT => {
            handle_device_connection(state, session, &envelope, false).await
        }
        messages::types::AUTH_RESPONSE => handle_auth_response(state, session, &envelope),
        messages::types::ONCE_KEY_UPDATE_CONFIRM => {
            handle_once_key_confirm(state, session, &envelope)
        }
        messages::types::DEVICE_STATUS_RESPONSE => {
            match envelope.parse::<messages::DeviceStatusResponse>() {
                Ok(status) => {
                    tracing::info!(session_id = %session.id, status = %status.status,
                        serial = %status.serial_number, "Device status reported");
                }
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e,
                        "malformed device_status_response");
                }
            }
            Flow::Continue
        }
        messages::types::PING => {
            state.hub.heartbeat(session);
            reply(session, messages::types::PONG, &messages::Pong { timestamp: Utc::now() });
            Flow::Continue
        }
        messages::types::PONG => {
            session.touch_pong();
            state.hub.heartbeat(session);
            Flow::Continue
        }
        other => {
            tracing::warn!(session_id = %session.id, msg_type = %other, "Unknown message type");
            send_error(session, other, "unknown_message", "unknown message type");
            Flow::Continue
        }
    }
}

fn handle_auth_response(
    state: &GatewayState,
    session: &Arc<ClientSession>,
    envelope: &WsEnvelope,
) -> Flow {
    let response: AuthResponse = match envelope.parse() {
        Ok(r) => r,
        Err(e) => {
            send_error(session, &envelope.msg_type, "parse_error", &e.to_string());
            return Flow::Continue;
        }
    };

    // Fresh task: response processing hits the store and must not block the
    // reader, so unrelated flows on this connection stay concurrent.
    let coordinator = state.coordinator.clone();
    let session_id = session.id;
    tokio::spawn(async move {
        if let Err(e) = coordinator.process_auth_response(&response).await {
            tracing::error!(session_id = %session_id, request_id = %response.request_id,
                error = %e, "auth_response processing failed");
        }
    });
    Flow::Continue
}

fn handle_once_key_confirm(
    state: &GatewayState,
    session: &Arc<ClientSession>,
    envelope: &WsEnvelope,
) -> Flow {
    let confirm: OnceKeyUpdateConfirm = match envelope.parse() {
        Ok(c) => c,
        Err(e) => {
            send_error(session, &envelope.msg_type, "parse_error", &e.to_string());
            return Flow::Continue;
        }
    };

    let coordinator = state.coordinator.clone();
    let session_id = session.id;
    tokio::spawn(async move {
        if let Err(e) = coordinator.confirm_once_key_update(&confirm).await {
            tracing::error!(session_id = %session_id, request_id = %confirm.request_id,
                error = %e, "once_key_update_confirm processing failed");
        }
    });
    Flow::Continue
}

// ── Device lifecycle ─────────────────────────────────────────────────────────

/// `device_init_request` — first contact from a brand-new medium. Creates
/// a group and a device in one transaction, both awaiting activation.
pub async fn handle_device_init(
    state: &GatewayState,
    session: &Arc<ClientSession>,
    envelope: &WsEnvelope,
) -> Flow {
    let request: DeviceInitRequest = match envelope.parse() {
        Ok(r) => r,
        Err(e) => {
            send_error(session, &envelope.msg_type, "parse_error", &e.to_string());
            return Flow::Continue;
        }
    };

    let existing = match devices::find_by_serial(
        &state.db.pool,
        &request.serial_number,
        &request.volume_serial_number,
    )
    .await
    {
        Ok(d) => d,
        Err(e) => return init_store_error(session, e),
    };
    if existing.is_some() {
        reply(session, messages::types::DEVICE_INIT_RESPONSE, &DeviceInitResponse {
            success: false,
            once_key: None,
            totp_uri: None,
            error: Some("device_already_exists".into()),
            message: Some("this device is already initialized".into()),
        });
        return Flow::Continue;
    }

    let totp_account = format!(
        "{}_{}",
        request.serial_number,
        &Uuid::new_v4().simple().to_string()[..6]
    );
    let totp_uri = totp::generate_secret_uri("EasyUKey", &totp_account);
    let once_key = ukey_common::crypto::generate_once_key();

    let now = Utc::now();
    let group = DeviceGroup {
        id: ids::generate_id(),
        user_id: None,
        name: format!("Group {}", serial_suffix(&request.serial_number)),
        description: "created at device initialization".into(),
        permissions: Vec::new(),
        totp_secret_uri: totp_uri.clone(),
        once_key: once_key.clone(),
        last_used_once_key: String::new(),
        is_active: false,
        created_at: now,
        updated_at: now,
    };
    let device = Device {
        id: ids::generate_id(),
        device_group_id: Some(group.id),
        name: format!("Device {}", serial_suffix(&request.serial_number)),
        serial_number: request.serial_number.clone(),
        volume_serial_number: request.volume_serial_number.clone(),
        vendor: request.vendor.clone(),
        model: request.model.clone(),
        remark: "device initialization".into(),
        is_active: false,
        is_online: false,
        last_heartbeat: None,
        last_online_at: None,
        last_offline_at: None,
        created_at: now,
        updated_at: now,
    };

    if let Err(e) = device_groups::create_group_with_device(&state.db.pool, &group, &device).await {
        return init_store_error(session, e);
    }

    session.set_device(device.id, &device.serial_number, &device.volume_serial_number);
    state.hub.register(session.clone());

    reply(session, messages::types::DEVICE_INIT_RESPONSE, &DeviceInitResponse {
        success: true,
        once_key: Some(once_key),
        totp_uri: Some(totp_uri),
        error: None,
        message: Some("device initialized, contact an administrator for activation".into()),
    });

    tracing::info!(session_id = %session.id, device_id = %device.id,
        serial = %device.serial_number, "Device initialized");
    Flow::Continue
}

/// `device_connection` / `device_reconnect`. Known devices connect
/// normally; an unknown medium presenting a valid (once_key, TOTP) pair
/// joins that group as a new cross-platform device. Reconnects skip the
/// cross-platform fallback.
pub async fn handle_device_connection(
    state: &GatewayState,
    session: &Arc<ClientSession>,
    envelope: &WsEnvelope,
    allow_cross_platform: bool,
) -> Flow {
    let request: DeviceConnection = match envelope.parse() {
        Ok(r) => r,
        Err(e) => {
            send_error(session, &envelope.msg_type, "parse_error", &e.to_string());
            return Flow::Continue;
        }
    };

    let found = match devices::find_by_serial(
        &state.db.pool,
        &request.serial_number,
        &request.volume_serial_number,
    )
    .await
    {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(session_id = %session.id, error = %e, "device lookup failed");
            reply_connection(session, false, connection_status::NO_MATCH, Some("store error"));
            return Flow::Continue;
        }
    };

    if let Some(device) = found {
        return connect_known_device(state, session, &request, device).await;
    }

    if allow_cross_platform && !request.once_key.is_empty() {
        return cross_platform_match(state, session, &request).await;
    }

    reply_connection(session, false, connection_status::NO_MATCH, Some("device not registered"));
    Flow::Continue
}

async fn connect_known_device(
    state: &GatewayState,
    session: &Arc<ClientSession>,
    request: &DeviceConnection,
    device: Device,
) -> Flow {
    let group = match device.device_group_id {
        Some(group_id) => device_groups::find_by_id(&state.db.pool, group_id)
            .await
            .ok()
            .flatten(),
        None => None,
    };

    if let Some(group) = &group {
        // Stale rolling credential on connect can indicate a replayed or
        // cloned medium; accept the connection but leave a trail.
        if !request.once_key.is_empty() && request.once_key != group.once_key {
            tracing::warn!(session_id = %session.id, device_id = %device.id,
                group_id = %group.id,
                "device presented a mismatching once_key on connect");
        }
    }

    session.set_device(device.id, &device.serial_number, &device.volume_serial_number);
    session.set_user(group.as_ref().and_then(|g| g.user_id));
    state.hub.register(session.clone());

    let status = if device.is_active {
        connection_status::CONNECTED
    } else {
        connection_status::PENDING_ACTIVATION
    };
    reply_connection(session, true, status, None);

    tracing::info!(session_id = %session.id, device_id = %device.id,
        user_id = ?group.as_ref().and_then(|g| g.user_id), status,
        "Device connected");
    Flow::Continue
}

async fn cross_platform_match(
    state: &GatewayState,
    session: &Arc<ClientSession>,
    request: &DeviceConnection,
) -> Flow {
    let group = match device_groups::find_active_by_once_key(&state.db.pool, &request.once_key)
        .await
    {
        Ok(g) => g,
        Err(e) => {
            tracing::error!(session_id = %session.id, error = %e, "group lookup failed");
            reply_connection(session, false, connection_status::NO_MATCH, Some("store error"));
            return Flow::Continue;
        }
    };

    let Some(group) = group else {
        reply_connection(session, false, connection_status::NO_MATCH, None);
        return Flow::Continue;
    };

    let totp_ok = totp::parse_totp_uri(&group.totp_secret_uri)
        .ok()
        .and_then(|cfg| totp::verify(&cfg, &request.totp_code, Utc::now()).ok())
        .unwrap_or(false);
    if !totp_ok {
        tracing::warn!(session_id = %session.id, group_id = %group.id,
            "cross-platform match rejected: TOTP mismatch");
        reply_connection(session, false, connection_status::NO_MATCH, None);
        return Flow::Continue;
    }

    let now = Utc::now();
    let device = Device {
        id: ids::generate_id(),
        device_group_id: Some(group.id),
        name: format!("Device {}", serial_suffix(&request.serial_number)),
        serial_number: request.serial_number.clone(),
        volume_serial_number: request.volume_serial_number.clone(),
        vendor: request.vendor.clone(),
        model: request.model.clone(),
        remark: "cross-platform".into(),
        is_active: false,
        is_online: false,
        last_heartbeat: None,
        last_online_at: None,
        last_offline_at: None,
        created_at: now,
        updated_at: now,
    };
    if let Err(e) = devices::create_device(&state.db.pool, &device).await {
        tracing::error!(session_id = %session.id, error = %e, "cross-platform device insert failed");
        reply_connection(session, false, connection_status::NO_MATCH, Some("store error"));
        return Flow::Continue;
    }

    session.set_device(device.id, &device.serial_number, &device.volume_serial_number);
    session.set_user(group.user_id);
    state.hub.register(session.clone());

    reply_connection(session, true, connection_status::PENDING_ACTIVATION, None);

    tracing::info!(session_id = %session.id, device_id = %device.id, group_id = %group.id,
        "Cross-platform device matched into group");
    Flow::Continue
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn serial_suffix(serial: &str) -> String {
    let skip = serial.chars().count().saturating_sub(6);
    serial.chars().skip(skip).collect()
}

fn init_store_error(session: &Arc<ClientSession>, e: sqlx::Error) -> Flow {
    tracing::error!(session_id = %session.id, error = %e, "device init failed");
    reply(session, messages::types::DEVICE_INIT_RESPONSE, &DeviceInitResponse {
        success: false,
        once_key: None,
        totp_uri: None,
        error: Some("store_error".into()),
        message: Some("device initialization failed".into()),
    });
    Flow::Continue
}

fn reply_connection(
    session: &Arc<ClientSession>,
    success: bool,
    status: &str,
    error: Option<&str>,
) {
    reply(session, messages::types::DEVICE_CONNECTION_RESPONSE, &DeviceConnectionResponse {
        success,
        status: status.to_owned(),
        error: error.map(str::to_owned),
    });
}

fn reply<T: serde::Serialize>(session: &Arc<ClientSession>, msg_type: &str, payload: &T) {
    if let Err(e) = session.enqueue(&WsEnvelope::new(msg_type, payload)) {
        tracing::warn!(session_id = %session.id, msg_type, error = %e, "reply enqueue failed");
    }
}

/// Typed error frame, sealed when the handshake is complete.
fn send_error(session: &Arc<ClientSession>, msg_type: &str, code: &str, detail: &str) {
    let envelope = WsEnvelope::new(
        msg_type,
        &ErrorMessage { error_code: code.to_owned(), error: detail.to_owned() },
    );
    if session.enqueue(&envelope).is_err() {
        session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use ukey_api::coordinator::Coordinator;
    use ukey_common::hub::DeviceHub;
    use ukey_db::{Database, DbBackend};

    use crate::hub::ConnectionHub;
    use crate::session::Outbound;
    use crate::status_sync::StatusSync;

    async fn test_state() -> GatewayState {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Database { pool, backend: DbBackend::Sqlite };
        db.migrate().await.unwrap();

        let (status_sync, _task) =
            StatusSync::spawn(db.clone(), 100, Duration::from_millis(50), 16);
        let (hub, cmd_rx) = ConnectionHub::new(status_sync);
        tokio::spawn(hub.clone().run(cmd_rx));

        let coordinator = Arc::new(Coordinator::new(db.clone(), hub.clone(), 300));
        GatewayState { db, hub, coordinator }
    }

    fn fresh_session() -> (Arc<ClientSession>, mpsc::Receiver<Outbound>) {
        ClientSession::new(16)
    }

    async fn recv_reply<T: serde::de::DeserializeOwned>(
        rx: &mut mpsc::Receiver<Outbound>,
        expected_type: &str,
    ) -> T {
        let Some(Outbound::Frame(text)) = rx.recv().await else {
            panic!("expected an outbound frame");
        };
        let env = WsEnvelope::from_bytes(text.as_bytes()).unwrap();
        assert_eq!(env.msg_type, expected_type);
        env.parse().unwrap()
    }

    fn init_envelope(serial: &str, volume: &str) -> WsEnvelope {
        WsEnvelope::new(messages::types::DEVICE_INIT_REQUEST, &DeviceInitRequest {
            serial_number: serial.into(),
            volume_serial_number: volume.into(),
            device_path: String::new(),
            vendor: "SanDisk".into(),
            model: "Ultra".into(),
        })
    }

    #[tokio::test]
    async fn device_init_creates_group_and_device() {
        let state = test_state().await;
        let (session, mut rx) = fresh_session();

        let flow = handle_device_init(&state, &session, &init_envelope("SN100", "VSN100")).await;
        assert_eq!(flow, Flow::Continue);

        let resp: DeviceInitResponse =
            recv_reply(&mut rx, messages::types::DEVICE_INIT_RESPONSE).await;
        assert!(resp.success);
        assert_eq!(resp.once_key.as_ref().unwrap().len(), 64);
        assert!(resp.totp_uri.unwrap().starts_with("otpauth://totp/"));

        let device = devices::find_by_serial(&state.db.pool, "SN100", "VSN100")
            .await
            .unwrap()
            .expect("device row created");
        assert!(!device.is_active);
        let group = device_groups::find_by_id(&state.db.pool, device.device_group_id.unwrap())
            .await
            .unwrap()
            .expect("group row created");
        assert!(!group.is_active);
        assert_eq!(group.once_key, resp.once_key.unwrap());

        // Registered to the hub immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.hub.is_device_online(device.id));
    }

    #[tokio::test]
    async fn device_init_refuses_duplicates() {
        let state = test_state().await;
        let (session, mut rx) = fresh_session();

        handle_device_init(&state, &session, &init_envelope("SN200", "VSN200")).await;
        let first: DeviceInitResponse =
            recv_reply(&mut rx, messages::types::DEVICE_INIT_RESPONSE).await;
        assert!(first.success);

        let (session2, mut rx2) = fresh_session();
        handle_device_init(&state, &session2, &init_envelope("SN200", "VSN200")).await;
        let second: DeviceInitResponse =
            recv_reply(&mut rx2, messages::types::DEVICE_INIT_RESPONSE).await;
        assert!(!second.success);
        assert_eq!(second.error.as_deref(), Some("device_already_exists"));
    }

    fn connection_envelope(
        msg_type: &str,
        serial: &str,
        volume: &str,
        once_key: &str,
        totp_code: &str,
    ) -> WsEnvelope {
        WsEnvelope::new(msg_type, &DeviceConnection {
            serial_number: serial.into(),
            volume_serial_number: volume.into(),
            vendor: String::new(),
            model: String::new(),
            totp_code: totp_code.into(),
            once_key: once_key.into(),
        })
    }

    #[tokio::test]
    async fn known_inactive_device_connects_pending_activation() {
        let state = test_state().await;

        let (init_session, mut init_rx) = fresh_session();
        handle_device_init(&state, &init_session, &init_envelope("SN300", "VSN300")).await;
        let init: DeviceInitResponse =
            recv_reply(&mut init_rx, messages::types::DEVICE_INIT_RESPONSE).await;

        let (session, mut rx) = fresh_session();
        let env = connection_envelope(
            messages::types::DEVICE_CONNECTION,
            "SN300",
            "VSN300",
            init.once_key.as_deref().unwrap(),
            "",
        );
        handle_device_connection(&state, &session, &env, true).await;

        let resp: DeviceConnectionResponse =
            recv_reply(&mut rx, messages::types::DEVICE_CONNECTION_RESPONSE).await;
        assert!(resp.success);
        assert_eq!(resp.status, connection_status::PENDING_ACTIVATION);
    }

    #[tokio::test]
    async fn cross_platform_match_joins_existing_group() {
        let state = test_state().await;

        // Seed a group via init, then activate it so it is match-eligible.
        let (init_session, mut init_rx) = fresh_session();
        handle_device_init(&state, &init_session, &init_envelope("SN400", "VSN400")).await;
        let init: DeviceInitResponse =
            recv_reply(&mut init_rx, messages::types::DEVICE_INIT_RESPONSE).await;
        let seeded = devices::find_by_serial(&state.db.pool, "SN400", "VSN400")
            .await
            .unwrap()
            .unwrap();
        let group_id = seeded.device_group_id.unwrap();
        device_groups::update_group(&state.db.pool, group_id, None, None, None, Some(true))
            .await
            .unwrap();

        let cfg = totp::parse_totp_uri(init.totp_uri.as_deref().unwrap()).unwrap();
        let code = totp::generate_at(&cfg, Utc::now()).unwrap();

        // A new medium presents the group's once_key + a valid TOTP.
        let (session, mut rx) = fresh_session();
        let env = connection_envelope(
            messages::types::DEVICE_CONNECTION,
            "SN401",
            "VSN401",
            init.once_key.as_deref().unwrap(),
            &code,
        );
        handle_device_connection(&state, &session, &env, true).await;

        let resp: DeviceConnectionResponse =
            recv_reply(&mut rx, messages::types::DEVICE_CONNECTION_RESPONSE).await;
        assert!(resp.success);
        assert_eq!(resp.status, connection_status::PENDING_ACTIVATION);

        let created = devices::find_by_serial(&state.db.pool, "SN401", "VSN401")
            .await
            .unwrap()
            .expect("cross-platform device row");
        assert_eq!(created.device_group_id, Some(group_id));
        assert!(!created.is_active);
        assert_eq!(created.remark, "cross-platform");
    }

    #[tokio::test]
    async fn cross_platform_match_rejects_bad_totp() {
        let state = test_state().await;

        let (init_session, mut init_rx) = fresh_session();
        handle_device_init(&state, &init_session, &init_envelope("SN500", "VSN500")).await;
        let init: DeviceInitResponse =
            recv_reply(&mut init_rx, messages::types::DEVICE_INIT_RESPONSE).await;
        let seeded = devices::find_by_serial(&state.db.pool, "SN500", "VSN500")
            .await
            .unwrap()
            .unwrap();
        device_groups::update_group(
            &state.db.pool,
            seeded.device_group_id.unwrap(),
            None,
            None,
            None,
            Some(true),
        )
        .await
        .unwrap();

        let (session, mut rx) = fresh_session();
        let env = connection_envelope(
            messages::types::DEVICE_CONNECTION,
            "SN501",
            "VSN501",
            init.once_key.as_deref().unwrap(),
            "000000",
        );
        handle_device_connection(&state, &session, &env, true).await;

        let resp: DeviceConnectionResponse =
            recv_reply(&mut rx, messages::types::DEVICE_CONNECTION_RESPONSE).await;
        assert!(!resp.success);
        assert_eq!(resp.status, connection_status::NO_MATCH);

        assert!(
            devices::find_by_serial(&state.db.pool, "SN501", "VSN501")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn reconnect_skips_cross_platform_fallback() {
        let state = test_state().await;

        let (session, mut rx) = fresh_session();
        let env = connection_envelope(
            messages::types::DEVICE_RECONNECT,
            "SN600",
            "VSN600",
            "some-once-key",
            "123456",
        );
        handle_device_connection(&state, &session, &env, false).await;

        let resp: DeviceConnectionResponse =
            recv_reply(&mut rx, messages::types::DEVICE_CONNECTION_RESPONSE).await;
        assert!(!resp.success);
        assert_eq!(resp.status, connection_status::NO_MATCH);
    }

    #[tokio::test]
    async fn plaintext_after_handshake_closes_connection() {
        let state = test_state().await;
        let (session, mut rx) = fresh_session();
        session.complete_handshake(ukey_common::crypto::Encryptor::new([1u8; 32]));

        let env = WsEnvelope::new(
            messages::types::PING,
            &messages::Ping { timestamp: Utc::now() },
        );
        let flow = dispatch(&state, &session, env).await;
        assert_eq!(flow, Flow::Close);

        // The error frame itself travels sealed.
        let Some(Outbound::Frame(text)) = rx.recv().await else {
            panic!("expected an error frame");
        };
        let outer = WsEnvelope::from_bytes(text.as_bytes()).unwrap();
        assert_eq!(outer.msg_type, "encrypted");
    }

    #[tokio::test]
    async fn pending_session_only_accepts_key_exchange() {
        let state = test_state().await;
        let (session, _rx) = fresh_session();

        let env = WsEnvelope::new(
            messages::types::DEVICE_CONNECTION,
            &serde_json::json!({"serial_number": "SN", "volume_serial_number": "VSN"}),
        );
        let flow = dispatch(&state, &session, env).await;
        assert_eq!(flow, Flow::Close);
    }

    #[tokio::test]
    async fn key_exchange_installs_working_encryptor() {
        let state = test_state().await;
        let (session, mut rx) = fresh_session();

        let client = ukey_common::crypto::EcdhKeyPair::generate();
        let env = WsEnvelope::new(messages::types::KEY_EXCHANGE_REQUEST, &KeyExchangeRequest {
            public_key: client.public_key_base64(),
        });
        let flow = dispatch(&state, &session, env).await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(session.handshake_status(), HandshakeStatus::Completed);

        let resp: KeyExchangeResponse =
            recv_reply(&mut rx, messages::types::KEY_EXCHANGE_RESPONSE).await;
        assert!(resp.success);

        // Both sides derive the same sealing key.
        let client_key = client.compute_shared(&resp.public_key).unwrap();
        let client_encryptor = ukey_common::crypto::Encryptor::new(client_key);
        let (payload, nonce) = client_encryptor.seal(b"probe").unwrap();
        let opened = session
            .open_frame(&EncryptedPayload { payload, nonce })
            .unwrap();
        assert_eq!(opened, b"probe");
    }
}

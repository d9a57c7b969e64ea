//! Authentication coordinator — drives the session state machine from the
//! API-initiated request through the device response and OnceKey rotation
//! to completion.
//!
//! ```text
//!           Start-Auth
//! Pending ─────────────► Processing ── rotate ──► ProcessingOnceKey ──confirm(ok)──► Completed/Success
//!    │                       │                           │
//!    │ timeout/expire        │ validate-fail             │ confirm(fail)
//!    ▼                       ▼                           ▼
//!  Expired                Failed                      Failed
//!    │
//!    │ user rejects
//!    ▼
//!  Rejected
//! ```
//!
//! The proposed OnceKey is held in memory until the device confirms it has
//! persisted the new value; only then is the group row rotated. The stored
//! key therefore always matches what the device holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use ukey_common::error::{UkeyError, UkeyResult};
use ukey_common::hub::{DeviceHub, HubError};
use ukey_common::ids;
use ukey_common::messages::{
    self, AuthRequest, AuthResponse, AuthSuccessResponse, OnceKeyUpdateConfirm, WsEnvelope,
    USER_REJECTED_ERROR,
};
use ukey_common::models::api_key::ApiKey;
use ukey_common::models::auth_session::{
    AuthResult, AuthSession, AuthStatus, StartAuthRequest, StartAuthResponse, VerifyAuthResponse,
};
use ukey_common::models::device::Device;
use ukey_common::models::device_group::DeviceGroup;
use ukey_common::{crypto, totp};
use ukey_db::repository::{api_keys, auth_sessions, device_groups, devices, users};
use ukey_db::Database;

use crate::callback;

/// Token separator inside the device credential.
const AUTH_KEY_SEPARATOR: &str = ":_:";

/// A rotation proposed to a device and not yet confirmed. The group row is
/// untouched until the confirm arrives.
#[derive(Debug, Clone)]
struct PendingRotation {
    group_id: Uuid,
    device_id: Uuid,
    old_key: String,
    new_key: String,
    expires_at: DateTime<Utc>,
}

pub struct Coordinator {
    db: Database,
    hub: Arc<dyn DeviceHub>,
    default_timeout_secs: u64,
    pending_rotations: Mutex<HashMap<Uuid, PendingRotation>>,
}

impl Coordinator {
    pub fn new(db: Database, hub: Arc<dyn DeviceHub>, default_timeout_secs: u64) -> Self {
        Self {
            db,
            hub,
            default_timeout_secs,
            pending_rotations: Mutex::new(HashMap::new()),
        }
    }

    // ── Start-Auth ───────────────────────────────────────────────────────────

    pub async fn start_auth(
        &self,
        req: &StartAuthRequest,
        api_key: &ApiKey,
        client_ip: &str,
    ) -> UkeyResult<StartAuthResponse> {
        let user = users::find_active_by_username(&self.db.pool, &req.username)
            .await?
            .ok_or(UkeyError::NotFound { resource: "User".into() })?;

        // Online, active member devices — hub presence over the DB column.
        let candidates = devices::list_active_by_user(&self.db.pool, user.id).await?;
        let online: Vec<&Device> = candidates
            .iter()
            .filter(|d| self.hub.is_device_online(d.id))
            .collect();
        if online.is_empty() {
            return Err(UkeyError::UserNotOnline);
        }

        if !req.action.is_empty() {
            let mut permitted = false;
            for device in &online {
                if let Some(group_id) = device.device_group_id {
                    if let Some(group) = device_groups::find_by_id(&self.db.pool, group_id).await? {
                        if group.allows_action(&req.action) {
                            permitted = true;
                            break;
                        }
                    }
                }
            }
            if !permitted {
                return Err(UkeyError::PermissionDenied { action: req.action.clone() });
            }
        }

        let timeout = req.timeout.unwrap_or(self.default_timeout_secs);
        let expires_at = Utc::now() + chrono::Duration::seconds(timeout as i64);

        let session = auth_sessions::create_session(
            &self.db.pool,
            ids::generate_id(),
            user.id,
            api_key.id,
            &req.challenge,
            &req.action,
            req.callback_url.as_deref(),
            client_ip,
            expires_at,
        )
        .await?;

        let envelope = WsEnvelope::new(
            messages::types::AUTH_REQUEST,
            &AuthRequest {
                request_id: session.id.to_string(),
                username: user.username.clone(),
                challenge: req.challenge.clone(),
                action: req.action.clone(),
                message: req.message.clone(),
                timeout,
            },
        );

        if let Err(e) = self.hub.send_to_user(user.id, envelope) {
            tracing::error!(session_id = %session.id, user_id = %user.id, error = %e,
                "Failed to deliver auth_request — failing session");
            auth_sessions::set_terminal(
                &self.db.pool,
                session.id,
                AuthStatus::Failed,
                AuthResult::Failure,
                None,
            )
            .await?;
            return Err(match e {
                HubError::UserOffline(_) => UkeyError::UserNotOnline,
                other => UkeyError::Internal(anyhow::anyhow!("auth_request delivery: {other}")),
            });
        }

        tracing::info!(session_id = %session.id, user = %user.username,
            action = %req.action, timeout, "Authentication session started");

        Ok(StartAuthResponse {
            session_id: session.id,
            status: session.status,
            expires_at: session.expires_at,
        })
    }

    // ── Device response ──────────────────────────────────────────────────────

    /// Handle an `auth_response` frame from a device. Every terminal outcome
    /// is persisted so `/auth/verify` observes it.
    pub async fn process_auth_response(&self, resp: &AuthResponse) -> UkeyResult<()> {
        let session_id = parse_session_id(&resp.request_id)?;

        let session = auth_sessions::find_by_id(&self.db.pool, session_id)
            .await?
            .ok_or(UkeyError::NotFound { resource: "Session".into() })?;

        if session.is_expired(Utc::now()) {
            auth_sessions::expire_session(&self.db.pool, session_id).await?;
            tracing::warn!(session_id = %session_id, "auth_response for expired session");
            return Ok(());
        }

        // Serialisation point: first responder flips Pending → Processing,
        // every other response is a duplicate.
        if !auth_sessions::transition(
            &self.db.pool,
            session_id,
            AuthStatus::Pending,
            AuthStatus::Processing,
        )
        .await?
        {
            tracing::warn!(session_id = %session_id, "auth_response for already-handled session");
            return Ok(());
        }

        let device = match devices::find_by_serial(
            &self.db.pool,
            &resp.serial_number,
            &resp.volume_serial_number,
        )
        .await?
        {
            Some(d) => d,
            None => {
                tracing::error!(session_id = %session_id, serial = %resp.serial_number,
                    "auth_response from unknown device");
                auth_sessions::set_terminal(
                    &self.db.pool,
                    session_id,
                    AuthStatus::Failed,
                    AuthResult::Failure,
                    None,
                )
                .await?;
                return Ok(());
            }
        };

        // A declined or failed confirmation carries no credential to check.
        if !resp.success {
            let status = if resp.error == USER_REJECTED_ERROR {
                AuthStatus::Rejected
            } else {
                AuthStatus::Failed
            };
            auth_sessions::set_terminal(
                &self.db.pool,
                session_id,
                status,
                AuthResult::Failure,
                Some(device.id),
            )
            .await?;
            tracing::info!(session_id = %session_id, device_id = %device.id,
                status = status.as_str(), error = %resp.error, "Authentication declined");
            return Ok(());
        }

        let group = match self.load_group(&device).await? {
            Some(g) => g,
            None => {
                tracing::error!(session_id = %session_id, device_id = %device.id,
                    "responding device has no active group");
                auth_sessions::set_terminal(
                    &self.db.pool,
                    session_id,
                    AuthStatus::Failed,
                    AuthResult::Failure,
                    Some(device.id),
                )
                .await?;
                return Ok(());
            }
        };

        if let Err(reason) = validate_auth_key(&resp.auth_key, &session, &device, &group) {
            tracing::warn!(session_id = %session_id, device_id = %device.id, %reason,
                "Credential validation failed");
            auth_sessions::set_terminal(
                &self.db.pool,
                session_id,
                AuthStatus::Failed,
                AuthResult::Failure,
                Some(device.id),
            )
            .await?;
            return Ok(());
        }

        if !session.action.is_empty() && !group.allows_action(&session.action) {
            tracing::warn!(session_id = %session_id, action = %session.action,
                "Device group lacks the requested permission");
            auth_sessions::set_terminal(
                &self.db.pool,
                session_id,
                AuthStatus::Failed,
                AuthResult::Failure,
                Some(device.id),
            )
            .await?;
            return Ok(());
        }

        auth_sessions::set_responding_device(&self.db.pool, session_id, device.id).await?;
        if !auth_sessions::transition(
            &self.db.pool,
            session_id,
            AuthStatus::Processing,
            AuthStatus::ProcessingOncekey,
        )
        .await?
        {
            tracing::warn!(session_id = %session_id, "session left Processing concurrently");
            return Ok(());
        }

        // Propose the rotated key; commit happens on confirm.
        let new_key = crypto::generate_once_key();
        self.pending_rotations.lock().unwrap().insert(
            session_id,
            PendingRotation {
                group_id: group.id,
                device_id: device.id,
                old_key: group.once_key.clone(),
                new_key: new_key.clone(),
                expires_at: session.expires_at,
            },
        );

        let envelope = WsEnvelope::new(
            messages::types::AUTH_SUCCESS_RESPONSE,
            &AuthSuccessResponse {
                request_id: session_id.to_string(),
                success: true,
                new_once_key: Some(new_key),
                error: None,
            },
        );
        if let Err(e) = self.hub.send_to_device(device.id, envelope) {
            // The sweeper fails the session if the device never confirms.
            tracing::error!(session_id = %session_id, device_id = %device.id, error = %e,
                "Failed to deliver auth_success_response");
        } else {
            tracing::info!(session_id = %session_id, device_id = %device.id,
                "OnceKey rotation proposed");
        }

        Ok(())
    }

    // ── OnceKey confirm ──────────────────────────────────────────────────────

    /// Handle `once_key_update_confirm`: commit or discard the pending
    /// rotation and drive the session terminal.
    pub async fn confirm_once_key_update(&self, confirm: &OnceKeyUpdateConfirm) -> UkeyResult<()> {
        let session_id = parse_session_id(&confirm.request_id)?;

        let Some(rotation) = self.pending_rotations.lock().unwrap().remove(&session_id) else {
            tracing::warn!(session_id = %session_id,
                "once_key_update_confirm without a pending rotation");
            return Ok(());
        };

        if !confirm.success {
            tracing::error!(session_id = %session_id, error = %confirm.error,
                "Device failed to persist the rotated OnceKey");
            auth_sessions::set_terminal(
                &self.db.pool,
                session_id,
                AuthStatus::Failed,
                AuthResult::Failure,
                Some(rotation.device_id),
            )
            .await?;
            return Ok(());
        }

        // All-or-nothing commit, guarded on the old key.
        let rotated = device_groups::rotate_once_key(
            &self.db.pool,
            rotation.group_id,
            &rotation.old_key,
            &rotation.new_key,
        )
        .await?;
        if !rotated {
            tracing::error!(session_id = %session_id, group_id = %rotation.group_id,
                "OnceKey rotation lost a race — failing session");
            auth_sessions::set_terminal(
                &self.db.pool,
                session_id,
                AuthStatus::Failed,
                AuthResult::Failure,
                Some(rotation.device_id),
            )
            .await?;
            return Ok(());
        }

        let completed = auth_sessions::set_terminal(
            &self.db.pool,
            session_id,
            AuthStatus::Completed,
            AuthResult::Success,
            Some(rotation.device_id),
        )
        .await?;
        if !completed {
            tracing::warn!(session_id = %session_id, "session expired before completion");
            return Ok(());
        }
        tracing::info!(session_id = %session_id, "Authentication completed");

        let Some(session) = auth_sessions::find_by_id(&self.db.pool, session_id).await? else {
            return Ok(());
        };
        if session.callback_url.is_some() {
            self.enqueue_callback(&session).await?;
        }

        Ok(())
    }

    // ── Verify ───────────────────────────────────────────────────────────────

    pub async fn verify_auth(&self, session_id: Uuid) -> UkeyResult<VerifyAuthResponse> {
        let (mut session, user) = auth_sessions::find_with_user(&self.db.pool, session_id)
            .await?
            .ok_or(UkeyError::NotFound { resource: "Session".into() })?;

        // Lazy expiry so callers never observe a live-looking overdue session.
        if !session.status.is_terminal() && session.is_expired(Utc::now()) {
            auth_sessions::expire_session(&self.db.pool, session_id).await?;
            session.status = AuthStatus::Expired;
        }

        let message = match (session.status, session.result) {
            (AuthStatus::Completed, Some(AuthResult::Success)) => "authentication successful",
            (AuthStatus::Rejected, _) => "authentication rejected by user",
            (AuthStatus::Expired, _) => "authentication session expired",
            (AuthStatus::Failed, _) => "authentication failed",
            _ => "authentication in progress",
        };

        Ok(VerifyAuthResponse {
            status: session.status,
            result: session.result,
            user_id: user.as_ref().map(|u| u.id),
            username: user.map(|u| u.username),
            message: message.into(),
        })
    }

    // ── Expiry sweeper ───────────────────────────────────────────────────────

    /// Periodic sweep mandated by the protocol: overdue non-terminal
    /// sessions become Expired, and their pending rotations are dropped.
    pub async fn run_expiry_sweeper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Utc::now();

            match auth_sessions::expire_overdue(&self.db.pool, now).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(count = n, "Swept expired authentication sessions"),
                Err(e) => tracing::error!(error = %e, "Session expiry sweep failed"),
            }

            self.pending_rotations
                .lock()
                .unwrap()
                .retain(|_, r| r.expires_at >= now);
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    async fn load_group(&self, device: &Device) -> UkeyResult<Option<DeviceGroup>> {
        let Some(group_id) = device.device_group_id else {
            return Ok(None);
        };
        let group = device_groups::find_by_id(&self.db.pool, group_id).await?;
        Ok(group.filter(|g| g.is_active))
    }

    async fn enqueue_callback(&self, session: &AuthSession) -> UkeyResult<()> {
        let user = users::find_by_id(&self.db.pool, session.user_id).await?;
        let api_key = api_keys::find_by_id(&self.db.pool, session.api_key_id).await?;
        let Some(api_key) = api_key else {
            tracing::error!(session_id = %session.id, "callback skipped: API key row missing");
            return Ok(());
        };

        let username = user.map(|u| u.username).unwrap_or_default();
        callback::spawn_delivery(session.clone(), username, api_key.api_key);
        Ok(())
    }
}

fn parse_session_id(raw: &str) -> UkeyResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| UkeyError::Validation {
        message: format!("malformed session id '{raw}'"),
    })
}

/// Validate the 5-part credential token against the session and the
/// device's group. Checks run in protocol order; the first failure wins.
fn validate_auth_key(
    auth_key: &str,
    session: &AuthSession,
    device: &Device,
    group: &DeviceGroup,
) -> Result<(), &'static str> {
    let parts: Vec<&str> = auth_key.split(AUTH_KEY_SEPARATOR).collect();
    let [challenge, once_key, totp_code, serial, volume_serial] = parts.as_slice() else {
        return Err("token does not split into five parts");
    };

    if *challenge != session.challenge {
        return Err("challenge mismatch");
    }
    if *serial != device.serial_number || *volume_serial != device.volume_serial_number {
        return Err("serial mismatch");
    }
    if *once_key != group.once_key {
        return Err("once-key mismatch");
    }

    let cfg = totp::parse_totp_uri(&group.totp_secret_uri).map_err(|_| "bad TOTP secret URI")?;
    match totp::verify(&cfg, totp_code, Utc::now()) {
        Ok(true) => Ok(()),
        Ok(false) => Err("TOTP code invalid"),
        Err(_) => Err("TOTP verification error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use ukey_common::models::user::User;

    // ── Fake hub ─────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeHub {
        online_devices: Mutex<HashSet<Uuid>>,
        online_users: Mutex<HashSet<Uuid>>,
        user_messages: Mutex<Vec<(Uuid, WsEnvelope)>>,
        device_messages: Mutex<Vec<(Uuid, WsEnvelope)>>,
    }

    impl FakeHub {
        fn set_online(&self, device_id: Uuid, user_id: Uuid) {
            self.online_devices.lock().unwrap().insert(device_id);
            self.online_users.lock().unwrap().insert(user_id);
        }
    }

    impl DeviceHub for FakeHub {
        fn is_device_online(&self, device_id: Uuid) -> bool {
            self.online_devices.lock().unwrap().contains(&device_id)
        }

        fn is_user_online(&self, user_id: Uuid) -> bool {
            self.online_users.lock().unwrap().contains(&user_id)
        }

        fn send_to_user(&self, user_id: Uuid, envelope: WsEnvelope) -> Result<(), HubError> {
            if !self.is_user_online(user_id) {
                return Err(HubError::UserOffline(user_id));
            }
            self.user_messages.lock().unwrap().push((user_id, envelope));
            Ok(())
        }

        fn send_to_device(&self, device_id: Uuid, envelope: WsEnvelope) -> Result<(), HubError> {
            if !self.is_device_online(device_id) {
                return Err(HubError::DeviceOffline(device_id));
            }
            self.device_messages.lock().unwrap().push((device_id, envelope));
            Ok(())
        }

        fn link_device_to_user(&self, _device_id: Uuid, _user_id: Uuid) -> Result<(), HubError> {
            Ok(())
        }

        fn broadcast(&self, _envelope: WsEnvelope) {}

        fn on_device_connect(&self, _device_id: Uuid) {}

        fn on_device_disconnect(&self, device_id: Uuid) {
            self.online_devices.lock().unwrap().remove(&device_id);
        }

        fn online_device_ids(&self) -> Vec<Uuid> {
            self.online_devices.lock().unwrap().iter().copied().collect()
        }
    }

    // ── Fixtures ─────────────────────────────────────────────────────────────

    async fn test_db() -> Database {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Database { pool, backend: ukey_db::DbBackend::Sqlite };
        db.migrate().await.unwrap();
        db
    }

    struct Fixture {
        db: Database,
        hub: Arc<FakeHub>,
        coordinator: Coordinator,
        user: User,
        api_key: ApiKey,
        device: Device,
        group: DeviceGroup,
    }

    async fn fixture(permissions: &[&str]) -> Fixture {
        let db = test_db().await;
        let hub = Arc::new(FakeHub::default());
        let coordinator = Coordinator::new(db.clone(), hub.clone(), 300);

        let user = users::create_user(
            &db.pool,
            ids::generate_id(),
            "alice",
            &["pay".to_string()],
        )
        .await
        .unwrap();

        let api_key = api_keys::create_api_key(
            &db.pool,
            ids::generate_id(),
            "test-caller",
            &crypto::generate_api_key(),
            false,
            None,
        )
        .await
        .unwrap();

        let now = Utc::now();
        let group = DeviceGroup {
            id: ids::generate_id(),
            user_id: Some(user.id),
            name: "group".into(),
            description: String::new(),
            permissions: permissions.iter().map(|s| s.to_string()).collect(),
            totp_secret_uri: totp::generate_secret_uri("EasyUKey", "SN1"),
            once_key: "ONCE1".into(),
            last_used_once_key: String::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        let device = Device {
            id: ids::generate_id(),
            device_group_id: Some(group.id),
            name: "ukey".into(),
            serial_number: "SN1".into(),
            volume_serial_number: "VSN1".into(),
            vendor: String::new(),
            model: String::new(),
            remark: String::new(),
            is_active: true,
            is_online: false,
            last_heartbeat: None,
            last_online_at: None,
            last_offline_at: None,
            created_at: now,
            updated_at: now,
        };
        device_groups::create_group_with_device(&db.pool, &group, &device)
            .await
            .unwrap();
        devices::update_device(&db.pool, device.id, None, None, Some(true))
            .await
            .unwrap();
        hub.set_online(device.id, user.id);

        Fixture { db, hub, coordinator, user, api_key, device, group }
    }

    fn start_request(action: &str) -> StartAuthRequest {
        StartAuthRequest {
            username: "alice".into(),
            challenge: "C0FFEE".into(),
            action: action.into(),
            message: String::new(),
            timeout: Some(60),
            callback_url: None,
        }
    }

    fn valid_totp(group: &DeviceGroup) -> String {
        let cfg = totp::parse_totp_uri(&group.totp_secret_uri).unwrap();
        totp::generate_at(&cfg, Utc::now()).unwrap()
    }

    fn token(challenge: &str, once_key: &str, code: &str) -> String {
        format!("{challenge}:_:{once_key}:_:{code}:_:SN1:_:VSN1")
    }

    async fn start(f: &Fixture, action: &str) -> StartAuthResponse {
        f.coordinator
            .start_auth(&start_request(action), &f.api_key, "127.0.0.1")
            .await
            .unwrap()
    }

    async fn session_status(f: &Fixture, id: Uuid) -> (AuthStatus, Option<AuthResult>) {
        let s = auth_sessions::find_by_id(&f.db.pool, id).await.unwrap().unwrap();
        (s.status, s.result)
    }

    // ── Start-Auth ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn start_auth_emits_exactly_one_request() {
        let f = fixture(&["pay"]).await;
        let resp = start(&f, "pay").await;

        assert_eq!(resp.status, AuthStatus::Pending);
        let sent = f.hub.user_messages.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, f.user.id);
        assert_eq!(sent[0].1.msg_type, "auth_request");
        let req: AuthRequest = sent[0].1.parse().unwrap();
        assert_eq!(req.challenge, "C0FFEE");
        assert_eq!(req.request_id, resp.session_id.to_string());
    }

    #[tokio::test]
    async fn start_auth_unknown_user_is_not_found() {
        let f = fixture(&["pay"]).await;
        let mut req = start_request("");
        req.username = "nobody".into();
        let err = f.coordinator.start_auth(&req, &f.api_key, "").await.unwrap_err();
        assert!(matches!(err, UkeyError::NotFound { .. }));
    }

    #[tokio::test]
    async fn start_auth_offline_user_is_unavailable() {
        let f = fixture(&["pay"]).await;
        f.hub.on_device_disconnect(f.device.id);
        let err = f
            .coordinator
            .start_auth(&start_request(""), &f.api_key, "")
            .await
            .unwrap_err();
        assert!(matches!(err, UkeyError::UserNotOnline));
    }

    #[tokio::test]
    async fn start_auth_checks_group_permissions() {
        let f = fixture(&["login"]).await;
        let err = f
            .coordinator
            .start_auth(&start_request("pay"), &f.api_key, "")
            .await
            .unwrap_err();
        assert!(matches!(err, UkeyError::PermissionDenied { .. }));
    }

    // ── Happy path (seed scenario 1) ─────────────────────────────────────────

    #[tokio::test]
    async fn happy_path_rotates_once_key_on_confirm() {
        let f = fixture(&["pay"]).await;
        let started = start(&f, "pay").await;

        let resp = AuthResponse {
            request_id: started.session_id.to_string(),
            success: true,
            auth_key: token("C0FFEE", "ONCE1", &valid_totp(&f.group)),
            error: String::new(),
            serial_number: "SN1".into(),
            volume_serial_number: "VSN1".into(),
        };
        f.coordinator.process_auth_response(&resp).await.unwrap();

        let (status, _) = session_status(&f, started.session_id).await;
        assert_eq!(status, AuthStatus::ProcessingOncekey);

        // Server proposed a new key to the device…
        let proposed = {
            let sent = f.hub.device_messages.lock().unwrap();
            assert_eq!(sent.len(), 1);
            let success: AuthSuccessResponse = sent[0].1.parse().unwrap();
            success.new_once_key.unwrap()
        };
        // …but the stored key is untouched until the confirm.
        let group = device_groups::find_by_id(&f.db.pool, f.group.id).await.unwrap().unwrap();
        assert_eq!(group.once_key, "ONCE1");

        f.coordinator
            .confirm_once_key_update(&OnceKeyUpdateConfirm {
                request_id: started.session_id.to_string(),
                success: true,
                error: String::new(),
            })
            .await
            .unwrap();

        let (status, result) = session_status(&f, started.session_id).await;
        assert_eq!(status, AuthStatus::Completed);
        assert_eq!(result, Some(AuthResult::Success));

        let group = device_groups::find_by_id(&f.db.pool, f.group.id).await.unwrap().unwrap();
        assert_eq!(group.once_key, proposed);
        assert_eq!(group.last_used_once_key, "ONCE1");

        let verify = f.coordinator.verify_auth(started.session_id).await.unwrap();
        assert_eq!(verify.status, AuthStatus::Completed);
        assert_eq!(verify.result, Some(AuthResult::Success));
        assert_eq!(verify.username.as_deref(), Some("alice"));
    }

    // ── Rejection (seed scenario 2) ──────────────────────────────────────────

    #[tokio::test]
    async fn user_rejection_terminates_without_rotation() {
        let f = fixture(&["pay"]).await;
        let started = start(&f, "pay").await;

        let resp = AuthResponse {
            request_id: started.session_id.to_string(),
            success: false,
            auth_key: String::new(),
            error: USER_REJECTED_ERROR.into(),
            serial_number: "SN1".into(),
            volume_serial_number: "VSN1".into(),
        };
        f.coordinator.process_auth_response(&resp).await.unwrap();

        let (status, result) = session_status(&f, started.session_id).await;
        assert_eq!(status, AuthStatus::Rejected);
        assert_eq!(result, Some(AuthResult::Failure));

        let group = device_groups::find_by_id(&f.db.pool, f.group.id).await.unwrap().unwrap();
        assert_eq!(group.once_key, "ONCE1");
        assert!(f.hub.device_messages.lock().unwrap().is_empty());
    }

    // ── Replay (seed scenario 3) ─────────────────────────────────────────────

    #[tokio::test]
    async fn stale_once_key_fails_the_session() {
        let f = fixture(&["pay"]).await;
        let started = start(&f, "pay").await;

        let resp = AuthResponse {
            request_id: started.session_id.to_string(),
            success: true,
            auth_key: token("C0FFEE", "ONCE0", &valid_totp(&f.group)),
            error: String::new(),
            serial_number: "SN1".into(),
            volume_serial_number: "VSN1".into(),
        };
        f.coordinator.process_auth_response(&resp).await.unwrap();

        let (status, result) = session_status(&f, started.session_id).await;
        assert_eq!(status, AuthStatus::Failed);
        assert_eq!(result, Some(AuthResult::Failure));

        let group = device_groups::find_by_id(&f.db.pool, f.group.id).await.unwrap().unwrap();
        assert_eq!(group.once_key, "ONCE1");
    }

    #[tokio::test]
    async fn wrong_challenge_fails_the_session() {
        let f = fixture(&["pay"]).await;
        let started = start(&f, "pay").await;

        let resp = AuthResponse {
            request_id: started.session_id.to_string(),
            success: true,
            auth_key: token("BADC0DE", "ONCE1", &valid_totp(&f.group)),
            error: String::new(),
            serial_number: "SN1".into(),
            volume_serial_number: "VSN1".into(),
        };
        f.coordinator.process_auth_response(&resp).await.unwrap();
        assert_eq!(session_status(&f, started.session_id).await.0, AuthStatus::Failed);
    }

    #[tokio::test]
    async fn malformed_token_fails_the_session() {
        let f = fixture(&["pay"]).await;
        let started = start(&f, "pay").await;

        let resp = AuthResponse {
            request_id: started.session_id.to_string(),
            success: true,
            auth_key: "C0FFEE:_:ONCE1".into(),
            error: String::new(),
            serial_number: "SN1".into(),
            volume_serial_number: "VSN1".into(),
        };
        f.coordinator.process_auth_response(&resp).await.unwrap();
        assert_eq!(session_status(&f, started.session_id).await.0, AuthStatus::Failed);
    }

    // ── Concurrency & terminality ────────────────────────────────────────────

    #[tokio::test]
    async fn second_response_is_a_no_op() {
        let f = fixture(&["pay"]).await;
        let started = start(&f, "pay").await;

        let reject = AuthResponse {
            request_id: started.session_id.to_string(),
            success: false,
            auth_key: String::new(),
            error: USER_REJECTED_ERROR.into(),
            serial_number: "SN1".into(),
            volume_serial_number: "VSN1".into(),
        };
        f.coordinator.process_auth_response(&reject).await.unwrap();

        // A later success response must not resurrect the session.
        let accept = AuthResponse {
            request_id: started.session_id.to_string(),
            success: true,
            auth_key: token("C0FFEE", "ONCE1", &valid_totp(&f.group)),
            error: String::new(),
            serial_number: "SN1".into(),
            volume_serial_number: "VSN1".into(),
        };
        f.coordinator.process_auth_response(&accept).await.unwrap();

        let (status, _) = session_status(&f, started.session_id).await;
        assert_eq!(status, AuthStatus::Rejected);
    }

    #[tokio::test]
    async fn failed_confirm_keeps_the_old_key() {
        let f = fixture(&["pay"]).await;
        let started = start(&f, "pay").await;

        let resp = AuthResponse {
            request_id: started.session_id.to_string(),
            success: true,
            auth_key: token("C0FFEE", "ONCE1", &valid_totp(&f.group)),
            error: String::new(),
            serial_number: "SN1".into(),
            volume_serial_number: "VSN1".into(),
        };
        f.coordinator.process_auth_response(&resp).await.unwrap();

        f.coordinator
            .confirm_once_key_update(&OnceKeyUpdateConfirm {
                request_id: started.session_id.to_string(),
                success: false,
                error: "write failed".into(),
            })
            .await
            .unwrap();

        let (status, result) = session_status(&f, started.session_id).await;
        assert_eq!(status, AuthStatus::Failed);
        assert_eq!(result, Some(AuthResult::Failure));

        let group = device_groups::find_by_id(&f.db.pool, f.group.id).await.unwrap().unwrap();
        assert_eq!(group.once_key, "ONCE1");
        assert_eq!(group.last_used_once_key, "");
    }

    #[tokio::test]
    async fn confirm_without_pending_rotation_is_ignored() {
        let f = fixture(&["pay"]).await;
        f.coordinator
            .confirm_once_key_update(&OnceKeyUpdateConfirm {
                request_id: Uuid::new_v4().to_string(),
                success: true,
                error: String::new(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn verify_expires_overdue_sessions() {
        let f = fixture(&["pay"]).await;
        let session = auth_sessions::create_session(
            &f.db.pool,
            ids::generate_id(),
            f.user.id,
            f.api_key.id,
            "C0FFEE",
            "",
            None,
            "",
            Utc::now() - chrono::Duration::seconds(5),
        )
        .await
        .unwrap();

        let verify = f.coordinator.verify_auth(session.id).await.unwrap();
        assert_eq!(verify.status, AuthStatus::Expired);

        let (status, _) = session_status(&f, session.id).await;
        assert_eq!(status, AuthStatus::Expired);
    }

    #[tokio::test]
    async fn sweeper_query_expires_overdue_sessions() {
        let f = fixture(&["pay"]).await;
        auth_sessions::create_session(
            &f.db.pool,
            ids::generate_id(),
            f.user.id,
            f.api_key.id,
            "C0FFEE",
            "",
            None,
            "",
            Utc::now() - chrono::Duration::seconds(5),
        )
        .await
        .unwrap();

        let swept = auth_sessions::expire_overdue(&f.db.pool, Utc::now()).await.unwrap();
        assert_eq!(swept, 1);
    }
}

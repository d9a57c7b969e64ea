//! # ukey-gateway
//!
//! WebSocket device gateway for EasyUKey. Handles:
//! - the ECDH handshake and transparent AES-GCM sealing per connection
//! - the connection hub (device/user registries, single-session policy)
//! - device lifecycle frames (init, connect, reconnect)
//! - relaying authentication frames into the coordinator
//! - batched presence mirroring via the status synchroniser

pub mod handlers;
pub mod hub;
pub mod session;
pub mod status_sync;

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;

use ukey_api::coordinator::Coordinator;
use ukey_common::messages::{self, Ping, WsEnvelope};
use ukey_db::Database;

use handlers::Flow;
use hub::ConnectionHub;
use session::{ClientSession, Outbound};

/// Gateway state shared with every connection task.
#[derive(Clone)]
pub struct GatewayState {
    pub db: Database,
    pub hub: Arc<ConnectionHub>,
    pub coordinator: Arc<Coordinator>,
}

/// Build the gateway router (`GET /ws`).
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(Arc::new(state))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let cfg = &ukey_common::config::get().websocket;
    ws.max_message_size(cfg.max_message_size)
        .on_upgrade(move |socket| handle_connection(socket, state))
}

/// One connection: a reader task (this future) plus a writer task draining
/// the session's bounded queue and emitting pings.
async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let cfg = ukey_common::config::get().websocket.clone();
    let (session, outbound_rx) = ClientSession::new(cfg.send_channel_buffer);

    tracing::info!(session_id = %session.id, "New WebSocket connection");

    let (sender, mut receiver) = socket.split();
    let writer = tokio::spawn(write_pump(
        sender,
        outbound_rx,
        cfg.write_wait(),
        cfg.ping_period(),
    ));

    // Read loop. Any inbound traffic counts as liveness; if nothing arrives
    // within pong_wait the peer is gone.
    loop {
        let frame = match timeout(cfg.pong_wait(), receiver.next()).await {
            Err(_) => {
                tracing::warn!(session_id = %session.id,
                    last_pong = %session.last_pong(), "liveness window elapsed");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::warn!(session_id = %session.id, error = %e, "WebSocket read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let raw = match &frame {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(bytes) => bytes.as_ref(),
            Message::Pong(_) => {
                session.touch_pong();
                continue;
            }
            Message::Ping(_) => continue, // axum answers transport pings
            Message::Close(_) => break,
        };

        let envelope = match WsEnvelope::from_bytes(raw) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "Malformed frame");
                break;
            }
        };

        if handlers::dispatch(&state, &session, envelope).await == Flow::Close {
            break;
        }
    }

    // Teardown: the hub clears the registries and flips presence.
    state.hub.unregister(session.clone());
    session.close();
    writer.abort();

    tracing::info!(session_id = %session.id, "WebSocket connection closed");
}

/// Drain the outbound queue onto the socket and emit a `ping` every
/// `ping_period`. Every write is bounded by `write_wait`; a missed
/// deadline drops the connection.
async fn write_pump(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: tokio::sync::mpsc::Receiver<Outbound>,
    write_wait: std::time::Duration,
    ping_period: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(ping_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick fires immediately; skip it

    loop {
        tokio::select! {
            maybe = outbound_rx.recv() => match maybe {
                Some(Outbound::Frame(text)) => {
                    match timeout(write_wait, sender.send(Message::Text(text.into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => break,
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = timeout(write_wait, sender.send(Message::Close(None))).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                let ping = WsEnvelope::new(
                    messages::types::PING,
                    &Ping { timestamp: chrono::Utc::now() },
                );
                let text = serde_json::to_string(&ping).expect("envelope serializes");
                match timeout(write_wait, sender.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => break,
                }
            }
        }
    }
}

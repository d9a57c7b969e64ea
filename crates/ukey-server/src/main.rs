//! # EasyUKey Server
//!
//! Single-process binary hosting:
//! - the REST API (`/api/v1`)
//! - the WebSocket device gateway (`/ws`)
//! - the connection hub, status synchroniser and session expiry sweeper
//!
//! Exits 0 on a clean shutdown, 1 when initialisation fails.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tokio::time::timeout;

use ukey_api::AppState;
use ukey_common::{crypto, ids};
use ukey_db::{Database, repository::api_keys};
use ukey_gateway::GatewayState;
use ukey_gateway::hub::ConnectionHub;
use ukey_gateway::status_sync::StatusSync;

#[derive(Parser)]
#[command(name = "ukey-server", version, about = "EasyUKey authentication server")]
struct Args {
    /// Path to a config file (TOML); environment variables override it.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = ukey_common::config::init(args.config.as_deref())?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ukey=info,ukey_server=info,tower_http=warn".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting EasyUKey server v{}", env!("CARGO_PKG_VERSION"));

    // Connect to the store and bring the schema up to date
    let db = Database::connect(config).await?;
    db.migrate().await?;

    // The admin surface must stay reachable from a fresh database.
    ensure_admin_key(&db).await?;

    // === Status synchroniser ===
    let ws = &config.websocket;
    let (status_sync, status_task) = StatusSync::spawn(
        db.clone(),
        ws.batch_size(),
        ws.sync_interval(),
        ws.update_channel_buffer(),
    );

    // === Connection hub ===
    let (hub, hub_commands) = ConnectionHub::new(status_sync);
    let hub_task = tokio::spawn(hub.clone().run(hub_commands));

    // === REST API + coordinator ===
    let app_state = AppState::new(db.clone(), hub.clone(), config.auth.default_timeout_secs);
    let coordinator = app_state.coordinator.clone();
    let sweeper_task = tokio::spawn(
        coordinator
            .clone()
            .run_expiry_sweeper(Duration::from_secs(config.auth.sweep_interval_secs)),
    );

    // === WebSocket gateway ===
    let gateway_state = GatewayState {
        db: db.clone(),
        hub: hub.clone(),
        coordinator,
    };

    let app = ukey_api::build_router(app_state).merge(ukey_gateway::build_router(gateway_state));

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!("API listening on http://{addr}/api/v1");
    tracing::info!("Gateway listening on ws://{addr}/ws");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain: stop producers, then give the status synchroniser its bounded
    // window to flush the dirty map.
    tracing::info!("Shutting down…");
    sweeper_task.abort();
    hub_task.abort();
    drop(hub);
    if timeout(config.server.graceful_shutdown(), status_task)
        .await
        .is_err()
    {
        tracing::warn!("status synchroniser did not drain within the shutdown window");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Create an initial admin API key when none exists. Logged once so the
/// operator can reach the admin surface of a fresh install.
async fn ensure_admin_key(db: &Database) -> anyhow::Result<()> {
    if api_keys::count_active_admin_keys(&db.pool).await? > 0 {
        return Ok(());
    }

    let secret = crypto::generate_api_key();
    let key = api_keys::create_api_key(
        &db.pool,
        ids::generate_id(),
        "bootstrap-admin",
        &secret,
        true,
        None,
    )
    .await?;

    tracing::warn!(key_id = %key.id,
        "No admin API key found — created one. Store it now: {secret}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}

//! # ukey-api
//!
//! REST API layer and authentication coordinator for the EasyUKey server.
//! Third-party callers drive the `/api/v1/auth` surface with an API key;
//! administrators manage users, devices, groups and keys behind the admin
//! gate. The coordinator in this crate also serves the gateway: inbound
//! `auth_response` / `once_key_update_confirm` frames land here.

pub mod callback;
pub mod coordinator;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use ukey_common::hub::DeviceHub;
use ukey_db::Database;

use coordinator::Coordinator;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    /// Injected hub handle — the gateway's connection registry.
    pub hub: Arc<dyn DeviceHub>,
    pub coordinator: Arc<Coordinator>,
}

impl AppState {
    pub fn new(db: Database, hub: Arc<dyn DeviceHub>, default_timeout_secs: u64) -> Self {
        let coordinator = Arc::new(Coordinator::new(db.clone(), hub.clone(), default_timeout_secs));
        Self { db, hub, coordinator }
    }
}

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let caller_routes = Router::new()
        .merge(routes::auth::router())
        .layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            middleware::require_api_key,
        ));

    let admin_routes = Router::new()
        .merge(routes::users::router())
        .merge(routes::devices::router())
        .merge(routes::device_groups::router())
        .merge(routes::api_keys::router())
        .merge(routes::sessions::router())
        .layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            middleware::require_admin_key,
        ));

    let api_routes = Router::new()
        .merge(caller_routes)
        .merge(admin_routes)
        .merge(routes::health::router());

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(shared)
}

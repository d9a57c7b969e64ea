//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for
//! production. Config precedence: env vars > .env file > config file > defaults.

use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call ukey_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// `config_path` is the optional `--config <path>` override; when absent a
/// `config.{toml,yaml,json}` next to the working directory is picked up if
/// present. Should be called once at application startup.
pub fn init(config_path: Option<&str>) -> anyhow::Result<&'static AppConfig> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let mut builder = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8888)?
        .set_default("server.graceful_shutdown_secs", 30)?
        .set_default("database.max_connections", 20)?
        .set_default("database.min_connections", 5)?
        .set_default("websocket.write_wait_secs", 10)?
        .set_default("websocket.pong_wait_secs", 60)?
        .set_default("websocket.ping_period_secs", 54)?
        .set_default("websocket.max_message_size", 512)?
        .set_default("websocket.send_channel_buffer", 256)?
        .set_default("websocket.max_connections", 1000)?
        .set_default("websocket.heartbeat_interval_secs", 30)?
        .set_default("auth.default_timeout_secs", 300)?
        .set_default("auth.sweep_interval_secs", 30)?;

    builder = match config_path {
        Some(path) => builder.add_source(config::File::with_name(path)),
        None => builder.add_source(config::File::with_name("config").required(false)),
    };

    let cfg = builder
        // Environment variables (EASYUKEY_SERVER__PORT, EASYUKEY_DATABASE__URL, …)
        .add_source(
            config::Environment::with_prefix("EASYUKEY")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    app_config.validate()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub websocket: WebSocketConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on in-flight work drain at shutdown.
    pub graceful_shutdown_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Connection URL — `postgres://…` or `sqlite://…`
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketConfig {
    /// Per-message write deadline.
    pub write_wait_secs: u64,
    /// Liveness window — the reader exits when nothing arrives within it.
    pub pong_wait_secs: u64,
    /// Server ping cadence; must stay below `pong_wait_secs`.
    pub ping_period_secs: u64,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Bounded outbound queue depth per connection.
    pub send_channel_buffer: usize,
    pub max_connections: usize,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Session lifetime when the caller supplies no timeout.
    pub default_timeout_secs: u64,
    /// Cadence of the expired-session sweeper.
    pub sweep_interval_secs: u64,
}

impl AppConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        if self.database.url.is_empty() {
            anyhow::bail!("database.url must be set");
        }
        if self.websocket.ping_period_secs >= self.websocket.pong_wait_secs {
            anyhow::bail!("websocket.ping_period_secs must be below websocket.pong_wait_secs");
        }
        if self.websocket.max_message_size == 0 || self.websocket.send_channel_buffer == 0 {
            anyhow::bail!("websocket message/queue sizes must be non-zero");
        }
        if self.websocket.max_connections == 0 {
            anyhow::bail!("websocket.max_connections must be non-zero");
        }
        if self.auth.default_timeout_secs == 0 || self.auth.sweep_interval_secs == 0 {
            anyhow::bail!("auth timeouts must be non-zero");
        }
        Ok(())
    }
}

impl ServerConfig {
    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }
}

impl WebSocketConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Status-sync batch size, derived from the connection ceiling.
    pub fn batch_size(&self) -> usize {
        (self.max_connections / 20).max(1)
    }

    /// Status-sync flush interval, a fraction of the heartbeat cadence.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs((self.heartbeat_interval_secs / 6).max(1))
    }

    /// Status-sync update channel depth.
    pub fn update_channel_buffer(&self) -> usize {
        (self.max_connections / 10).max(1)
    }
}

//! # ukey-db
//!
//! Database layer for the EasyUKey server.
//!
//! The backing store is selected from the `database.url` config value:
//!
//! * **Full mode** (`postgres://…`) — PostgreSQL.
//! * **Lite mode** (`sqlite://…`) — embedded SQLite, no external services.
//!
//! Both run over `sqlx::AnyPool`; UUID/timestamp/JSON columns travel as TEXT
//! and are decoded by the manual `FromRow` impls in `ukey_common::any_row`.

pub mod repository;

use anyhow::Result;

/// Which backing store is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbBackend {
    Postgres,
    Sqlite,
}

impl DbBackend {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("sqlite://") || url.starts_with("sqlite:") {
            DbBackend::Sqlite
        } else {
            DbBackend::Postgres
        }
    }
}

/// Shared database state passed through Axum extractors and the gateway.
#[derive(Clone)]
pub struct Database {
    /// SQL pool — works with both Postgres and SQLite.
    pub pool: sqlx::AnyPool,
    /// Which backend is active.
    pub backend: DbBackend,
}

impl Database {
    /// Connect using the URL in `config.database.url`.
    pub async fn connect(config: &ukey_common::config::AppConfig) -> Result<Self> {
        // Register all built-in drivers (Postgres + SQLite).
        sqlx::any::install_default_drivers();

        let backend = DbBackend::from_url(&config.database.url);

        let pool = match backend {
            DbBackend::Postgres => {
                tracing::info!("Connecting to PostgreSQL…");
                sqlx::any::AnyPoolOptions::new()
                    .max_connections(config.database.max_connections)
                    .min_connections(config.database.min_connections)
                    .connect(&config.database.url)
                    .await?
            }
            DbBackend::Sqlite => {
                tracing::info!("Connecting to SQLite: {}", &config.database.url);
                sqlx::any::AnyPoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .connect(&config.database.url)
                    .await?
            }
        };

        Ok(Self { pool, backend })
    }

    /// Run the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations…");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Migrations complete");
        Ok(())
    }
}

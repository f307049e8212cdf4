use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::config::DatabaseConfig;

use super::{MIGRATION_001_INITIAL, SqliteAccountStore, SqliteTransactionLog};

/// Handle on the SQLite database backing both the account store and the
/// transaction log.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a connection pool. WAL mode lets history reads run while a
    /// write transaction is open.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("Invalid database url: {}", config.url))?
            .create_if_missing(config.create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout())
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        tracing::debug!(url = %config.url, "connected to database");
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Connect and migrate.
    pub async fn init(config: &DatabaseConfig) -> Result<Self> {
        let db = Self::connect(config).await?;
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn account_store(&self) -> SqliteAccountStore {
        SqliteAccountStore::new(self.pool.clone())
    }

    pub fn transaction_log(&self) -> SqliteTransactionLog {
        SqliteTransactionLog::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

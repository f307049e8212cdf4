use std::time::Duration;

use serde::Deserialize;

/// Connection settings for the SQLite database.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection url, e.g. `sqlite:wallet.db`
    pub url: String,
    pub max_connections: u32,
    /// How long SQLite waits on a locked database before reporting busy
    pub busy_timeout_ms: u64,
    pub create_if_missing: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:wallet-ledger.db".to_string(),
            max_connections: 8,
            busy_timeout_ms: 5_000,
            create_if_missing: true,
        }
    }
}

impl DatabaseConfig {
    /// Config for a database file at `path`, everything else default.
    pub fn for_path(path: &str) -> Self {
        Self {
            url: format!("sqlite:{path}"),
            ..Self::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Bounds for the ledger engine's retries and waits. Nothing blocks forever.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Compare-and-set attempts per top-up before giving up with `Contention`
    pub max_cas_attempts: u32,
    /// Longest wait for an account lock
    pub lock_timeout_ms: u64,
    /// Attempts per storage call when SQLite reports busy
    pub storage_attempts: u32,
    /// Base backoff between storage attempts, multiplied by the attempt number
    pub storage_backoff_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_cas_attempts: 5,
            lock_timeout_ms: 5_000,
            storage_attempts: 3,
            storage_backoff_ms: 10,
        }
    }
}

impl LedgerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn storage_backoff(&self) -> Duration {
        Duration::from_millis(self.storage_backoff_ms)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }
}

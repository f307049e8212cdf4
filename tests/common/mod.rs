// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use wallet_ledger::LedgerService;
use wallet_ledger::config::{DatabaseConfig, LedgerConfig};
use wallet_ledger::storage::{AccountStore, Database, TransactionLog};

/// Generous lock timeout so slow CI disks never turn into spurious contention.
pub fn test_config() -> LedgerConfig {
    LedgerConfig::default().with_lock_timeout(Duration::from_secs(60))
}

/// Helper to create a migrated database in a temporary directory
pub async fn test_database() -> Result<(Database, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let database = Database::init(&DatabaseConfig::for_path(db_path.to_str().unwrap())).await?;
    Ok((database, temp_dir))
}

/// Helper to create a test service with a temporary database
pub async fn test_service() -> Result<(LedgerService, TempDir)> {
    let (database, temp_dir) = test_database().await?;
    Ok((LedgerService::from_database(&database, test_config()), temp_dir))
}

/// Sum of every stored balance.
pub async fn total_balance<S: AccountStore, L: TransactionLog>(
    service: &LedgerService<S, L>,
) -> Result<i64> {
    Ok(service
        .list_accounts()
        .await?
        .iter()
        .map(|account| account.balance)
        .sum())
}

/// Number of records in an account's history.
pub async fn history_len<S: AccountStore, L: TransactionLog>(
    service: &LedgerService<S, L>,
    account: &str,
) -> Result<usize> {
    Ok(service.queries().history(account)?.records().await?.len())
}

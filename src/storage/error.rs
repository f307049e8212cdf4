use thiserror::Error;

use crate::domain::{AccountId, MinorUnits};

/// SQLite primary result codes that mean "try again later".
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Account not found: {0}")]
    NotFound(AccountId),

    #[error("Refusing to store negative balance {balance} for account {account}")]
    NegativeBalance {
        account: AccountId,
        balance: MinorUnits,
    },

    #[error("Storage temporarily unavailable: {0}")]
    Transient(#[source] sqlx::Error),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Corrupt row: {0:#}")]
    Corrupt(anyhow::Error),
}

impl StoreError {
    /// True when the operation did not take effect and may be retried as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_busy(&err) {
            StoreError::Transient(err)
        } else {
            StoreError::Database(err)
        }
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            // Extended codes carry the primary code in the low byte.
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
        _ => false,
    }
}

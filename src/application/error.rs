use thiserror::Error;

use crate::domain::{AccountId, MinorUnits};
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid account identifier: {0:?}")]
    InvalidAccount(String),

    #[error("Cannot transfer from account {0} to itself")]
    SameAccount(AccountId),

    #[error("Insufficient funds in account {account}: balance {balance}, required {required}")]
    InsufficientFunds {
        account: AccountId,
        balance: MinorUnits,
        required: MinorUnits,
    },

    #[error("Account not found: {0}")]
    NotFound(AccountId),

    #[error("Contention: {0}")]
    Contention(String),

    #[error("Storage failure: {0}")]
    StorageFailure(#[source] StoreError),

    #[error("Account {0} changed while its lock was held")]
    ConcurrencyViolation(AccountId),

    #[error("Rollback of account {account} failed: {reason}")]
    RollbackFailed { account: AccountId, reason: String },

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Database setup failed: {0:#}")]
    Setup(#[from] anyhow::Error),
}

impl LedgerError {
    /// Expected business outcomes and validation failures. Nothing was
    /// mutated and retrying the same request gives the same answer.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidAmount(_)
                | LedgerError::InvalidAccount(_)
                | LedgerError::SameAccount(_)
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::NotFound(_)
        )
    }

    /// The ledger is unchanged and the whole operation may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Contention(_) => true,
            LedgerError::StorageFailure(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(account) => LedgerError::NotFound(account),
            other => LedgerError::StorageFailure(other),
        }
    }
}

/// Parse a caller-supplied identifier.
pub(crate) fn parse_account(raw: &str) -> Result<AccountId, LedgerError> {
    AccountId::new(raw).ok_or_else(|| LedgerError::InvalidAccount(raw.to_string()))
}

use std::future::Future;

use futures_util::stream::BoxStream;

use crate::domain::{
    Account, AccountId, CasOutcome, MinorUnits, NewTransaction, TransactionRecord, VersionToken,
    VersionedBalance,
};

use super::StoreError;

/// Lazy sequence of committed log records.
pub type RecordStream<'a> = BoxStream<'a, Result<TransactionRecord, StoreError>>;

/// Durable mapping from account to versioned balance.
///
/// Every write goes through [`AccountStore::compare_and_set`]; there is no
/// blind update.
pub trait AccountStore: Send + Sync + 'static {
    /// Current balance and the token needed to change it.
    /// Fails with [`StoreError::NotFound`] for an account never created.
    fn get_balance(
        &self,
        account: &AccountId,
    ) -> impl Future<Output = Result<VersionedBalance, StoreError>> + Send;

    /// Make sure the account exists, with balance 0 if it is new.
    /// Idempotent.
    fn create_if_absent(
        &self,
        account: &AccountId,
    ) -> impl Future<Output = Result<VersionToken, StoreError>> + Send;

    /// Store `new_balance` iff the account still carries `expected`.
    /// A conflict has no side effects.
    fn compare_and_set(
        &self,
        account: &AccountId,
        expected: VersionToken,
        new_balance: MinorUnits,
    ) -> impl Future<Output = Result<CasOutcome, StoreError>> + Send;

    fn list_accounts(&self) -> impl Future<Output = Result<Vec<Account>, StoreError>> + Send;
}

/// Read side of the transaction log. Only committed records are ever yielded.
pub trait TransactionLogReader: Send + Sync + 'static {
    /// Records touching `account`, oldest first. Each call starts a fresh scan.
    fn query_by_account(&self, account: &AccountId) -> RecordStream<'_>;

    /// Every record in log order.
    fn scan_all(&self) -> RecordStream<'_>;
}

/// Append-only transaction log.
pub trait TransactionLog: TransactionLogReader {
    fn append(
        &self,
        record: NewTransaction,
    ) -> impl Future<Output = Result<TransactionRecord, StoreError>> + Send;

    /// Append several records as one durability unit: all become visible
    /// together or none do.
    fn append_batch(
        &self,
        records: Vec<NewTransaction>,
    ) -> impl Future<Output = Result<Vec<TransactionRecord>, StoreError>> + Send;
}

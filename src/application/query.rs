use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};

use crate::domain::{AccountId, TransactionRecord};
use crate::storage::TransactionLogReader;

use super::{LedgerError, parse_account};

/// Read-only projections over the transaction log.
///
/// Holds only the reader half of the log, so it cannot append.
pub struct QueryService<R> {
    log: Arc<R>,
}

impl<R> Clone for QueryService<R> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
        }
    }
}

impl<R: TransactionLogReader> QueryService<R> {
    pub fn new(log: Arc<R>) -> Self {
        Self { log }
    }

    /// History of one account, oldest first. Nothing is read until the
    /// history is streamed.
    pub fn history(&self, account: &str) -> Result<History<R>, LedgerError> {
        Ok(History {
            log: Arc::clone(&self.log),
            account: parse_account(account)?,
        })
    }
}

/// A restartable view of one account's records.
///
/// Every call to [`History::stream`] starts a fresh scan of the log, so a
/// second pass also sees records committed after the first one began.
pub struct History<R> {
    log: Arc<R>,
    account: AccountId,
}

impl<R: TransactionLogReader> History<R> {
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn stream(&self) -> BoxStream<'_, Result<TransactionRecord, LedgerError>> {
        self.log
            .query_by_account(&self.account)
            .map_err(LedgerError::from)
            .boxed()
    }

    /// Drain one pass into memory.
    pub async fn records(&self) -> Result<Vec<TransactionRecord>, LedgerError> {
        self.stream().try_collect().await
    }
}

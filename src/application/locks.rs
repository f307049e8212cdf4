use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};
use tokio::time::{Instant, timeout_at};

use crate::domain::AccountId;

use super::LedgerError;

type Slot = Arc<AsyncMutex<()>>;

/// Per-account mutual exclusion, keyed by account id.
///
/// Every mutating operation also holds a shared permit on a ledger-wide
/// barrier; [`AccountLocks::exclusive`] takes it exclusively so an audit sees
/// no operation half-applied.
#[derive(Debug, Clone, Default)]
pub struct AccountLocks {
    table: Arc<Mutex<HashMap<AccountId, Slot>>>,
    barrier: Arc<RwLock<()>>,
}

/// Held account locks. Released, in reverse order, when dropped.
#[derive(Debug)]
pub struct AccountGuard {
    table: Arc<Mutex<HashMap<AccountId, Slot>>>,
    held: Vec<(AccountId, OwnedMutexGuard<()>)>,
    _permit: OwnedRwLockReadGuard<()>,
}

/// Ledger-wide exclusive permit. No account lock can be taken while it lives.
#[derive(Debug)]
pub struct ExclusiveGuard {
    _permit: OwnedRwLockWriteGuard<()>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every account in `accounts`, always in ascending id order and
    /// regardless of the order given. Duplicates are locked once.
    ///
    /// Gives up with [`LedgerError::Contention`] once `timeout` has elapsed;
    /// any locks already taken are released on the way out.
    pub async fn acquire(
        &self,
        accounts: &[&AccountId],
        timeout: Duration,
    ) -> Result<AccountGuard, LedgerError> {
        let deadline = Instant::now() + timeout;

        let permit = timeout_at(deadline, Arc::clone(&self.barrier).read_owned())
            .await
            .map_err(|_| {
                LedgerError::Contention(format!(
                    "timed out after {timeout:?} waiting for the ledger barrier"
                ))
            })?;

        let mut ordered: Vec<AccountId> = accounts.iter().map(|id| (*id).clone()).collect();
        ordered.sort();
        ordered.dedup();

        let mut guard = AccountGuard {
            table: Arc::clone(&self.table),
            held: Vec::with_capacity(ordered.len()),
            _permit: permit,
        };

        for account in ordered {
            let slot = self.slot(&account);
            match timeout_at(deadline, slot.lock_owned()).await {
                Ok(lock) => guard.held.push((account, lock)),
                Err(_) => {
                    tracing::debug!(account = %account, ?timeout, "account lock wait timed out");
                    return Err(LedgerError::Contention(format!(
                        "timed out after {timeout:?} waiting for account {account}"
                    )));
                }
            }
        }

        Ok(guard)
    }

    /// Wait until no operation holds account locks, then keep new ones out.
    pub async fn exclusive(&self, timeout: Duration) -> Result<ExclusiveGuard, LedgerError> {
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.barrier).write_owned())
            .await
            .map_err(|_| {
                LedgerError::Contention(format!(
                    "timed out after {timeout:?} waiting for in-flight operations"
                ))
            })?;
        Ok(ExclusiveGuard { _permit: permit })
    }

    /// Number of accounts with a live lock slot.
    pub fn tracked(&self) -> usize {
        lock_table(&self.table).len()
    }

    fn slot(&self, account: &AccountId) -> Slot {
        let mut table = lock_table(&self.table);
        Arc::clone(table.entry(account.clone()).or_default())
    }
}

impl AccountGuard {
    pub fn accounts(&self) -> impl Iterator<Item = &AccountId> {
        self.held.iter().map(|(account, _)| account)
    }
}

impl Drop for AccountGuard {
    fn drop(&mut self) {
        let mut released = Vec::with_capacity(self.held.len());
        while let Some((account, lock)) = self.held.pop() {
            drop(lock);
            released.push(account);
        }

        // Forget slots nobody else holds or waits on.
        let mut table = lock_table(&self.table);
        for account in released {
            if table
                .get(&account)
                .is_some_and(|slot| Arc::strong_count(slot) == 1)
            {
                table.remove(&account);
            }
        }
    }
}

fn lock_table(
    table: &Mutex<HashMap<AccountId, Slot>>,
) -> std::sync::MutexGuard<'_, HashMap<AccountId, Slot>> {
    // The table is never left half-updated, so a poisoned lock is still usable.
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

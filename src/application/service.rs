use std::future::Future;
use std::sync::Arc;

use futures_util::TryStreamExt;
use serde::Serialize;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::config::{DatabaseConfig, LedgerConfig};
use crate::domain::{
    Account, AccountId, AuditBuilder, AuditReport, CasOutcome, CorrelationId, MinorUnits,
    NewTransaction, TransactionRecord, VersionToken, VersionedBalance,
};
use crate::storage::{
    AccountStore, Database, SqliteAccountStore, SqliteTransactionLog, StoreError, TransactionLog,
};

use super::{AccountLocks, LedgerError, QueryService, parse_account};

/// Ledger engine: the only writer of balances and log records.
///
/// Cheap to clone; clones share the stores and the lock table. Every
/// mutating call runs on its own tokio task, so dropping the returned
/// future does not interrupt an operation half way: it still commits or
/// rolls back, and releases its locks.
pub struct LedgerService<S = SqliteAccountStore, L = SqliteTransactionLog> {
    inner: Arc<Engine<S, L>>,
}

impl<S, L> Clone for LedgerService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Result of a committed top-up
#[derive(Debug, Clone, Serialize)]
pub struct TopUpReceipt {
    pub account: AccountId,
    pub balance: MinorUnits,
    pub record: TransactionRecord,
}

/// Result of a committed transfer
#[derive(Debug, Clone, Serialize)]
pub struct TransferReceipt {
    pub correlation_id: CorrelationId,
    pub from_balance: MinorUnits,
    pub to_balance: MinorUnits,
    pub debit: TransactionRecord,
    pub credit: TransactionRecord,
}

struct Engine<S, L> {
    accounts: S,
    log: Arc<L>,
    locks: AccountLocks,
    config: LedgerConfig,
}

impl LedgerService {
    /// Open (creating if needed) and migrate the SQLite database.
    pub async fn init(database: &DatabaseConfig, config: LedgerConfig) -> Result<Self, LedgerError> {
        let db = Database::init(database).await?;
        Ok(Self::from_database(&db, config))
    }

    /// Connect to an already initialized database.
    pub async fn connect(
        database: &DatabaseConfig,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        let db = Database::connect(database).await?;
        Ok(Self::from_database(&db, config))
    }

    pub fn from_database(db: &Database, config: LedgerConfig) -> Self {
        Self::new(db.account_store(), db.transaction_log(), config)
    }
}

impl<S: AccountStore, L: TransactionLog> LedgerService<S, L> {
    pub fn new(accounts: S, log: L, config: LedgerConfig) -> Self {
        Self {
            inner: Arc::new(Engine {
                accounts,
                log: Arc::new(log),
                locks: AccountLocks::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.inner.config
    }

    /// Read-only view over the transaction log.
    pub fn queries(&self) -> QueryService<L> {
        QueryService::new(Arc::clone(&self.inner.log))
    }

    /// Deposit `amount` minor units into `account`, opening it if needed.
    pub async fn top_up(
        &self,
        account: &str,
        amount: MinorUnits,
    ) -> Result<TopUpReceipt, LedgerError> {
        let account = parse_account(account)?;
        let engine = Arc::clone(&self.inner);
        detached(async move { engine.top_up(account, amount).await }).await
    }

    /// Move `amount` minor units from one existing account to another.
    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: MinorUnits,
    ) -> Result<TransferReceipt, LedgerError> {
        let from = parse_account(from)?;
        let to = parse_account(to)?;
        let engine = Arc::clone(&self.inner);
        detached(async move { engine.transfer(from, to, amount).await }).await
    }

    /// Current balance. Never observes an operation that is still in flight
    /// on this account.
    pub async fn get_balance(&self, account: &str) -> Result<MinorUnits, LedgerError> {
        let account = parse_account(account)?;
        self.inner.balance(&account).await
    }

    /// All accounts, taken while no operation is in flight.
    pub async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        let engine = &self.inner;
        let _quiet = engine.locks.exclusive(engine.config.lock_timeout()).await?;
        Ok(engine.accounts.list_accounts().await?)
    }

    /// Recompute ledger health from both stores. Operations are held off
    /// for the duration, so the report reflects one consistent state.
    #[instrument(name = "audit", skip(self))]
    pub async fn audit(&self) -> Result<AuditReport, LedgerError> {
        let engine = &self.inner;
        let _quiet = engine.locks.exclusive(engine.config.lock_timeout()).await?;

        let accounts = engine.accounts.list_accounts().await?;
        let mut builder = AuditBuilder::new();
        let mut records = engine.log.scan_all();
        while let Some(record) = records.try_next().await? {
            builder.observe(&record);
        }
        let report = builder.finish(&accounts);

        if report.is_healthy() {
            info!(
                accounts = report.account_count,
                records = report.record_count,
                "ledger audit passed"
            );
        } else {
            warn!(
                conservation = report.conservation_holds,
                unbalanced = report.unbalanced_transfers.len(),
                mismatched = report.mismatched_balances.len(),
                negative = report.negative_balances.len(),
                orphans = report.orphan_records,
                "ledger audit found problems"
            );
        }
        Ok(report)
    }
}

/// Run an operation to completion on its own task.
async fn detached<T, F>(operation: F) -> Result<T, LedgerError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, LedgerError>> + Send + 'static,
{
    tokio::spawn(operation.in_current_span())
        .await
        .map_err(|err| LedgerError::Aborted(err.to_string()))?
}

impl<S: AccountStore, L: TransactionLog> Engine<S, L> {
    #[instrument(name = "top_up", skip(self, account), fields(account = %account))]
    async fn top_up(
        &self,
        account: AccountId,
        amount: MinorUnits,
    ) -> Result<TopUpReceipt, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "top-up amount must be positive, got {amount}"
            )));
        }

        let _guard = self
            .locks
            .acquire(&[&account], self.config.lock_timeout())
            .await?;

        self.retry_storage("create_if_absent", || {
            self.accounts.create_if_absent(&account)
        })
        .await?;

        let (prior, applied) = self.credit(&account, amount).await?;

        let pending = NewTransaction::topup(account.clone(), amount, applied.balance);
        match self
            .retry_storage("append", || self.log.append(pending.clone()))
            .await
        {
            Ok(record) => {
                info!(record = record.id, balance = applied.balance, "top-up committed");
                Ok(TopUpReceipt {
                    account,
                    balance: applied.balance,
                    record,
                })
            }
            Err(err) => {
                warn!(error = %err, "log append failed, rolling back top-up");
                self.compensate(&account, applied.version, prior.balance)
                    .await?;
                Err(LedgerError::StorageFailure(err))
            }
        }
    }

    /// Optimistic read-add-write loop for a top-up.
    /// Returns the balance before and after.
    async fn credit(
        &self,
        account: &AccountId,
        amount: MinorUnits,
    ) -> Result<(VersionedBalance, VersionedBalance), LedgerError> {
        let attempts = self.config.max_cas_attempts.max(1);
        for attempt in 1..=attempts {
            let current = self
                .retry_storage("get_balance", || self.accounts.get_balance(account))
                .await?;
            let new_balance = current.balance.checked_add(amount).ok_or_else(|| {
                LedgerError::InvalidAmount(format!(
                    "crediting {amount} would overflow balance {}",
                    current.balance
                ))
            })?;

            match self
                .retry_storage("compare_and_set", || {
                    self.accounts
                        .compare_and_set(account, current.version, new_balance)
                })
                .await?
            {
                CasOutcome::Applied(version) => {
                    return Ok((
                        current,
                        VersionedBalance {
                            balance: new_balance,
                            version,
                        },
                    ));
                }
                CasOutcome::Conflict => {
                    debug!(attempt, version = %current.version, "version conflict, re-reading balance");
                }
            }
        }

        Err(LedgerError::Contention(format!(
            "account {account} changed {attempts} times in a row"
        )))
    }

    #[instrument(name = "transfer", skip(self, from, to), fields(from = %from, to = %to))]
    async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: MinorUnits,
    ) -> Result<TransferReceipt, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "transfer amount must be positive, got {amount}"
            )));
        }
        if from == to {
            return Err(LedgerError::SameAccount(from));
        }

        let _guard = self
            .locks
            .acquire(&[&from, &to], self.config.lock_timeout())
            .await?;

        let source = self
            .retry_storage("get_balance", || self.accounts.get_balance(&from))
            .await?;
        let destination = self
            .retry_storage("get_balance", || self.accounts.get_balance(&to))
            .await?;

        if source.balance < amount {
            info!(balance = source.balance, amount, "transfer rejected: insufficient funds");
            return Err(LedgerError::InsufficientFunds {
                account: from,
                balance: source.balance,
                required: amount,
            });
        }

        let from_after = source.balance - amount;
        let to_after = destination.balance.checked_add(amount).ok_or_else(|| {
            LedgerError::InvalidAmount(format!(
                "crediting {amount} would overflow balance {}",
                destination.balance
            ))
        })?;

        let from_version = match self
            .retry_storage("compare_and_set", || {
                self.accounts
                    .compare_and_set(&from, source.version, from_after)
            })
            .await?
        {
            CasOutcome::Applied(version) => version,
            CasOutcome::Conflict => {
                error!(account = %from, "balance changed under a held lock");
                return Err(LedgerError::ConcurrencyViolation(from));
            }
        };

        let credited = self
            .retry_storage("compare_and_set", || {
                self.accounts
                    .compare_and_set(&to, destination.version, to_after)
            })
            .await;
        let to_version = match credited {
            Ok(CasOutcome::Applied(version)) => version,
            Ok(CasOutcome::Conflict) => {
                error!(account = %to, "balance changed under a held lock");
                self.compensate(&from, from_version, source.balance)
                    .await?;
                return Err(LedgerError::ConcurrencyViolation(to));
            }
            Err(err) => {
                warn!(error = %err, "credit failed, rolling back debit");
                self.compensate(&from, from_version, source.balance)
                    .await?;
                return Err(err.into());
            }
        };

        let legs = NewTransaction::transfer_legs(
            from.clone(),
            from_after,
            to.clone(),
            to_after,
            amount,
        );
        let correlation_id = legs[0].correlation_id;

        let appended = self
            .retry_storage("append_batch", || self.log.append_batch(legs.to_vec()))
            .await;
        let records = match appended {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "log append failed, rolling back transfer");
                // Undo both sides even if the first undo fails.
                let credit_undo = self.compensate(&to, to_version, destination.balance).await;
                let debit_undo = self.compensate(&from, from_version, source.balance).await;
                credit_undo.and(debit_undo)?;
                return Err(LedgerError::StorageFailure(err));
            }
        };

        let [debit, credit]: [TransactionRecord; 2] =
            records.try_into().map_err(|records: Vec<TransactionRecord>| {
                LedgerError::StorageFailure(StoreError::Corrupt(anyhow::anyhow!(
                    "log committed {} legs for transfer {correlation_id}",
                    records.len()
                )))
            })?;

        info!(
            %correlation_id,
            from_balance = from_after,
            to_balance = to_after,
            "transfer committed"
        );
        Ok(TransferReceipt {
            correlation_id,
            from_balance: from_after,
            to_balance: to_after,
            debit,
            credit,
        })
    }

    async fn balance(&self, account: &AccountId) -> Result<MinorUnits, LedgerError> {
        let _guard = self
            .locks
            .acquire(&[account], self.config.lock_timeout())
            .await?;
        let current = self
            .retry_storage("get_balance", || self.accounts.get_balance(account))
            .await?;
        Ok(current.balance)
    }

    /// Put `account` back to `prior` after a later step of the same
    /// operation failed. The caller still holds the account lock.
    async fn compensate(
        &self,
        account: &AccountId,
        applied: VersionToken,
        prior: MinorUnits,
    ) -> Result<(), LedgerError> {
        let outcome = self
            .retry_storage("compensate", || {
                self.accounts.compare_and_set(account, applied, prior)
            })
            .await;

        let reason = match outcome {
            Ok(CasOutcome::Applied(_)) => {
                warn!(account = %account, restored = prior, "balance rolled back");
                return Ok(());
            }
            Ok(CasOutcome::Conflict) => format!("version moved past {applied}"),
            Err(err) => err.to_string(),
        };

        error!(
            account = %account,
            expected_version = %applied,
            restore_to = prior,
            %reason,
            "ROLLBACK FAILED: balance has no matching log record and needs manual repair"
        );
        Err(LedgerError::RollbackFailed {
            account: account.clone(),
            reason,
        })
    }

    /// Retry a storage call while it fails with a transient error,
    /// backing off a little longer each time.
    async fn retry_storage<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.config.storage_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < attempts => {
                    debug!(op, attempt, error = %err, "transient storage error, retrying");
                    tokio::time::sleep(self.config.storage_backoff() * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

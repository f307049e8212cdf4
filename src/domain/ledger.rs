use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use super::{Account, AccountId, CorrelationId, MinorUnits, TransactionKind, TransactionRecord};

/// Compute every account's balance by replaying log records.
/// Balance = sum of signed record amounts for the account.
pub fn replay_balances(records: &[TransactionRecord]) -> HashMap<AccountId, i128> {
    let mut balances: HashMap<AccountId, i128> = HashMap::new();
    for record in records {
        *balances.entry(record.account.clone()).or_insert(0) += i128::from(record.amount);
    }
    balances
}

/// A stored balance that the log does not explain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceMismatch {
    pub account: AccountId,
    pub stored: MinorUnits,
    pub replayed: i128,
    pub last_balance_after: Option<MinorUnits>,
}

/// Result of a full ledger audit.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub account_count: usize,
    pub record_count: usize,
    pub total_balance: i128,
    pub total_deposits: i128,
    pub conservation_holds: bool,
    /// Transfers whose legs are not exactly one debit and one credit summing to zero
    pub unbalanced_transfers: Vec<CorrelationId>,
    pub mismatched_balances: Vec<BalanceMismatch>,
    pub negative_balances: Vec<AccountId>,
    /// Records pointing at accounts the store does not know
    pub orphan_records: usize,
}

impl AuditReport {
    pub fn is_healthy(&self) -> bool {
        self.conservation_holds
            && self.unbalanced_transfers.is_empty()
            && self.mismatched_balances.is_empty()
            && self.negative_balances.is_empty()
            && self.orphan_records == 0
    }
}

#[derive(Debug, Default)]
struct Legs {
    debits: u32,
    credits: u32,
    sum: i128,
}

#[derive(Debug, Default)]
struct Replay {
    sum: i128,
    last_balance_after: Option<MinorUnits>,
}

/// Incremental audit. Records are fed in log order, so the whole log never
/// has to sit in memory.
#[derive(Debug, Default)]
pub struct AuditBuilder {
    record_count: usize,
    total_deposits: i128,
    replays: HashMap<AccountId, Replay>,
    transfers: BTreeMap<CorrelationId, Legs>,
}

impl AuditBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, record: &TransactionRecord) {
        self.record_count += 1;

        let replay = self.replays.entry(record.account.clone()).or_default();
        replay.sum += i128::from(record.amount);
        replay.last_balance_after = Some(record.balance_after);

        match record.kind {
            TransactionKind::Topup => self.total_deposits += i128::from(record.amount),
            TransactionKind::TransferDebit | TransactionKind::TransferCredit => {
                let legs = self.transfers.entry(record.correlation_id).or_default();
                legs.sum += i128::from(record.amount);
                if record.kind == TransactionKind::TransferDebit && record.amount < 0 {
                    legs.debits += 1;
                } else if record.kind == TransactionKind::TransferCredit && record.amount > 0 {
                    legs.credits += 1;
                } else {
                    // A leg with the wrong sign can never balance.
                    legs.debits += 2;
                }
            }
        }
    }

    pub fn finish(mut self, accounts: &[Account]) -> AuditReport {
        let mut mismatched_balances = Vec::new();
        let mut negative_balances = Vec::new();
        let mut total_balance: i128 = 0;

        for account in accounts {
            total_balance += i128::from(account.balance);
            if account.balance < 0 {
                negative_balances.push(account.id.clone());
            }

            let replay = self.replays.remove(&account.id).unwrap_or_default();
            let consistent = replay.sum == i128::from(account.balance)
                && replay
                    .last_balance_after
                    .is_none_or(|last| last == account.balance);
            if !consistent {
                mismatched_balances.push(BalanceMismatch {
                    account: account.id.clone(),
                    stored: account.balance,
                    replayed: replay.sum,
                    last_balance_after: replay.last_balance_after,
                });
            }
        }

        let unbalanced_transfers = self
            .transfers
            .into_iter()
            .filter(|(_, legs)| !(legs.debits == 1 && legs.credits == 1 && legs.sum == 0))
            .map(|(correlation_id, _)| correlation_id)
            .collect();

        AuditReport {
            account_count: accounts.len(),
            record_count: self.record_count,
            total_balance,
            total_deposits: self.total_deposits,
            conservation_holds: total_balance == self.total_deposits,
            unbalanced_transfers,
            mismatched_balances,
            negative_balances,
            orphan_records: self.replays.len(),
        }
    }
}

/// Build an audit report from a complete set of accounts and records.
pub fn build_audit_report(accounts: &[Account], records: &[TransactionRecord]) -> AuditReport {
    let mut builder = AuditBuilder::new();
    for record in records {
        builder.observe(record);
    }
    builder.finish(accounts)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::domain::{NewTransaction, VersionToken};

    fn id(s: &str) -> AccountId {
        AccountId::new(s).unwrap()
    }

    fn account(name: &str, balance: MinorUnits) -> Account {
        Account {
            id: id(name),
            balance,
            version: VersionToken(1),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn commit_all(pending: Vec<NewTransaction>) -> Vec<TransactionRecord> {
        pending
            .into_iter()
            .enumerate()
            .map(|(i, tx)| tx.commit(i as i64 + 1))
            .collect()
    }

    fn sample_log() -> Vec<TransactionRecord> {
        let mut pending = vec![NewTransaction::topup(id("a"), 1000, 1000)];
        pending.extend(NewTransaction::transfer_legs(id("a"), 600, id("b"), 400, 400));
        commit_all(pending)
    }

    #[test]
    fn test_replay_balances() {
        let balances = replay_balances(&sample_log());
        assert_eq!(balances.get(&id("a")), Some(&600));
        assert_eq!(balances.get(&id("b")), Some(&400));
    }

    #[test]
    fn test_healthy_ledger() {
        let report = build_audit_report(&[account("a", 600), account("b", 400)], &sample_log());

        assert!(report.is_healthy(), "{report:?}");
        assert_eq!(report.record_count, 3);
        assert_eq!(report.total_balance, 1000);
        assert_eq!(report.total_deposits, 1000);
    }

    #[test]
    fn test_empty_ledger_is_healthy() {
        let report = build_audit_report(&[], &[]);
        assert!(report.is_healthy());
        assert_eq!(report.account_count, 0);
    }

    #[test]
    fn test_detects_tampered_balance() {
        let report = build_audit_report(&[account("a", 700), account("b", 400)], &sample_log());

        assert!(!report.is_healthy());
        assert!(!report.conservation_holds);
        assert_eq!(report.mismatched_balances.len(), 1);
        assert_eq!(report.mismatched_balances[0].account, id("a"));
        assert_eq!(report.mismatched_balances[0].replayed, 600);
    }

    #[test]
    fn test_detects_missing_transfer_leg() {
        let mut log = sample_log();
        log.pop();
        let report = build_audit_report(&[account("a", 600), account("b", 0)], &log);

        assert_eq!(report.unbalanced_transfers.len(), 1);
        assert_eq!(report.unbalanced_transfers[0], log[1].correlation_id);
    }

    #[test]
    fn test_detects_orphans_and_negative_balances() {
        let stray = NewTransaction::topup(id("ghost"), 5, 5).commit(9);
        let report = build_audit_report(&[account("a", -5)], &[stray]);

        assert_eq!(report.orphan_records, 1);
        assert_eq!(report.negative_balances, vec![id("a")]);
        assert!(!report.is_healthy());
    }

    #[test]
    fn test_wrong_sign_leg_never_balances() {
        let correlation_id = Uuid::new_v4();
        let mut legs = commit_all(
            NewTransaction::transfer_legs(id("a"), 0, id("b"), 0, 10).to_vec(),
        );
        for leg in &mut legs {
            leg.correlation_id = correlation_id;
            leg.amount = -leg.amount;
        }
        let report = build_audit_report(&[], &legs);
        assert_eq!(report.unbalanced_transfers, vec![correlation_id]);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AccountId, MinorUnits};

/// Identifier assigned by the transaction log. Strictly increasing in append order.
pub type RecordId = i64;

/// Links the legs of one logical operation. A transfer has exactly two legs.
pub type CorrelationId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionKind {
    /// External deposit into an account
    Topup,
    /// Outgoing leg of a transfer (negative amount)
    TransferDebit,
    /// Incoming leg of a transfer (positive amount)
    TransferCredit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Topup => "topup",
            TransactionKind::TransferDebit => "transfer-debit",
            TransactionKind::TransferCredit => "transfer-credit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "topup" => Some(TransactionKind::Topup),
            "transfer-debit" => Some(TransactionKind::TransferDebit),
            "transfer-credit" => Some(TransactionKind::TransferCredit),
            _ => None,
        }
    }

    pub fn is_transfer_leg(&self) -> bool {
        matches!(
            self,
            TransactionKind::TransferDebit | TransactionKind::TransferCredit
        )
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record about to be appended. The log assigns the id on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub account: AccountId,
    /// Signed: credits positive, debits negative
    pub amount: MinorUnits,
    pub kind: TransactionKind,
    pub correlation_id: CorrelationId,
    /// Account balance once this record is applied
    pub balance_after: MinorUnits,
    pub timestamp: DateTime<Utc>,
}

impl NewTransaction {
    pub fn topup(account: AccountId, amount: MinorUnits, balance_after: MinorUnits) -> Self {
        Self {
            account,
            amount,
            kind: TransactionKind::Topup,
            correlation_id: Uuid::new_v4(),
            balance_after,
            timestamp: Utc::now(),
        }
    }

    /// Build the debit and credit legs of one transfer. Both legs share a
    /// correlation id and a timestamp, and their amounts sum to zero.
    pub fn transfer_legs(
        from: AccountId,
        from_balance_after: MinorUnits,
        to: AccountId,
        to_balance_after: MinorUnits,
        amount: MinorUnits,
    ) -> [Self; 2] {
        assert!(amount > 0, "Transfer amount must be positive");
        let correlation_id = Uuid::new_v4();
        let timestamp = Utc::now();
        [
            Self {
                account: from,
                amount: -amount,
                kind: TransactionKind::TransferDebit,
                correlation_id,
                balance_after: from_balance_after,
                timestamp,
            },
            Self {
                account: to,
                amount,
                kind: TransactionKind::TransferCredit,
                correlation_id,
                balance_after: to_balance_after,
                timestamp,
            },
        ]
    }

    /// Attach the id the log assigned. Only the log calls this.
    pub fn commit(self, id: RecordId) -> TransactionRecord {
        TransactionRecord {
            id,
            account: self.account,
            amount: self.amount,
            kind: self.kind,
            correlation_id: self.correlation_id,
            balance_after: self.balance_after,
            timestamp: self.timestamp,
        }
    }
}

/// A committed, immutable entry of the transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: RecordId,
    pub account: AccountId,
    pub amount: MinorUnits,
    pub kind: TransactionKind,
    pub correlation_id: CorrelationId,
    pub balance_after: MinorUnits,
    pub timestamp: DateTime<Utc>,
}

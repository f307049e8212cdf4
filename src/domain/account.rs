use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MinorUnits;

/// Opaque, stable account identifier.
///
/// Ordering is plain byte order of the identifier. Multi-account locks are
/// always taken in this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Build an identifier, refusing empty or whitespace-only input.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl AsRef<str> for AccountId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Optimistic concurrency token. Bumped by every successful compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(pub i64);

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A balance as read from the account store, together with the token that
/// must be presented to change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionedBalance {
    pub balance: MinorUnits,
    pub version: VersionToken,
}

/// Outcome of a compare-and-set against the account store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The new balance was persisted; the account now carries this token.
    Applied(VersionToken),
    /// The stored version moved on. Nothing was written.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: MinorUnits,
    pub version: VersionToken,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

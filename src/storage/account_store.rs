use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::domain::{
    Account, AccountId, CasOutcome, MinorUnits, VersionToken, VersionedBalance,
};

use super::{AccountStore, StoreError};

/// Account balances in the `accounts` table.
#[derive(Debug, Clone)]
pub struct SqliteAccountStore {
    pool: SqlitePool,
}

impl SqliteAccountStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn exists(&self, account: &AccountId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM accounts WHERE id = ?")
            .bind(account.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    fn row_to_account(row: &SqliteRow) -> anyhow::Result<Account> {
        let id: String = row.try_get("id")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Account {
            id: AccountId::new(id).context("Empty account ID")?,
            balance: row.try_get("balance")?,
            version: VersionToken(row.try_get("version")?),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .context("Invalid created_at timestamp")?
                .with_timezone(&Utc),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .context("Invalid updated_at timestamp")?
                .with_timezone(&Utc),
        })
    }
}

impl AccountStore for SqliteAccountStore {
    async fn get_balance(&self, account: &AccountId) -> Result<VersionedBalance, StoreError> {
        let row = sqlx::query("SELECT balance, version FROM accounts WHERE id = ?")
            .bind(account.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(VersionedBalance {
                balance: row.try_get("balance")?,
                version: VersionToken(row.try_get("version")?),
            }),
            None => Err(StoreError::NotFound(account.clone())),
        }
    }

    async fn create_if_absent(&self, account: &AccountId) -> Result<VersionToken, StoreError> {
        let now = Utc::now().to_rfc3339();
        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (id, balance, version, created_at, updated_at)
            VALUES (?, 0, 0, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(account.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            tracing::info!(account = %account, "opened account");
        }

        Ok(self.get_balance(account).await?.version)
    }

    async fn compare_and_set(
        &self,
        account: &AccountId,
        expected: VersionToken,
        new_balance: MinorUnits,
    ) -> Result<CasOutcome, StoreError> {
        if new_balance < 0 {
            return Err(StoreError::NegativeBalance {
                account: account.clone(),
                balance: new_balance,
            });
        }

        let row = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            RETURNING version
            "#,
        )
        .bind(new_balance)
        .bind(Utc::now().to_rfc3339())
        .bind(account.as_str())
        .bind(expected.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(CasOutcome::Applied(VersionToken(row.try_get("version")?))),
            None if self.exists(account).await? => Ok(CasOutcome::Conflict),
            None => Err(StoreError::NotFound(account.clone())),
        }
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, balance, version, created_at, updated_at
            FROM accounts
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::row_to_account(row).map_err(StoreError::Corrupt))
            .collect()
    }
}

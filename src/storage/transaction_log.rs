use anyhow::Context;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::domain::{AccountId, NewTransaction, RecordId, TransactionKind, TransactionRecord};

use super::{RecordStream, StoreError, TransactionLog, TransactionLogReader};

const SELECT_BY_ACCOUNT: &str = r#"
    SELECT id, account_id, amount, kind, correlation_id, balance_after, created_at
    FROM transactions
    WHERE account_id = ?
    ORDER BY id
"#;

const SELECT_ALL: &str = r#"
    SELECT id, account_id, amount, kind, correlation_id, balance_after, created_at
    FROM transactions
    ORDER BY id
"#;

/// Append-only log in the `transactions` table. Triggers in the schema
/// refuse updates and deletes.
#[derive(Debug, Clone)]
pub struct SqliteTransactionLog {
    pool: SqlitePool,
}

impl SqliteTransactionLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert(
        conn: &mut SqliteConnection,
        record: &NewTransaction,
    ) -> Result<RecordId, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO transactions (account_id, amount, kind, correlation_id, balance_after, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(record.account.as_str())
        .bind(record.amount)
        .bind(record.kind.as_str())
        .bind(record.correlation_id.to_string())
        .bind(record.balance_after)
        .bind(record.timestamp.to_rfc3339())
        .fetch_one(conn)
        .await?;

        Ok(row.try_get("id")?)
    }

    fn row_to_record(row: &SqliteRow) -> anyhow::Result<TransactionRecord> {
        let account: String = row.try_get("account_id")?;
        let kind: String = row.try_get("kind")?;
        let correlation_id: String = row.try_get("correlation_id")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(TransactionRecord {
            id: row.try_get("id")?,
            account: AccountId::new(account).context("Empty account ID")?,
            amount: row.try_get("amount")?,
            kind: TransactionKind::parse(&kind)
                .ok_or_else(|| anyhow::anyhow!("Invalid transaction kind: {}", kind))?,
            correlation_id: Uuid::parse_str(&correlation_id).context("Invalid correlation ID")?,
            balance_after: row.try_get("balance_after")?,
            timestamp: DateTime::parse_from_rfc3339(&created_at)
                .context("Invalid created_at timestamp")?
                .with_timezone(&Utc),
        })
    }

    fn decode(row: Result<SqliteRow, sqlx::Error>) -> Result<TransactionRecord, StoreError> {
        let row = row?;
        Self::row_to_record(&row).map_err(StoreError::Corrupt)
    }
}

impl TransactionLogReader for SqliteTransactionLog {
    fn query_by_account(&self, account: &AccountId) -> RecordStream<'_> {
        // `fetch` streams rows as SQLite produces them; nothing is buffered.
        sqlx::query(SELECT_BY_ACCOUNT)
            .bind(account.as_str().to_owned())
            .fetch(&self.pool)
            .map(Self::decode)
            .boxed()
    }

    fn scan_all(&self) -> RecordStream<'_> {
        sqlx::query(SELECT_ALL)
            .fetch(&self.pool)
            .map(Self::decode)
            .boxed()
    }
}

impl TransactionLog for SqliteTransactionLog {
    async fn append(&self, record: NewTransaction) -> Result<TransactionRecord, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let id = Self::insert(&mut *conn, &record).await?;
        Ok(record.commit(id))
    }

    async fn append_batch(
        &self,
        records: Vec<NewTransaction>,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        // Dropping the transaction on any error rolls every insert back.
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(records.len());
        for record in &records {
            ids.push(Self::insert(&mut *tx, record).await?);
        }
        tx.commit().await?;

        Ok(records
            .into_iter()
            .zip(ids)
            .map(|(record, id)| record.commit(id))
            .collect())
    }
}


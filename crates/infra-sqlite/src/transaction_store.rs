// SQLite TransactionStore Implementation

use async_trait::async_trait;
use pkgtxn_core::domain::{
    PackageSet, Phase, Transaction, TransactionId, TransactionKind, TransactionState,
};
use pkgtxn_core::error::{AppError, Result};
use pkgtxn_core::port::TransactionStore;
use sqlx::SqlitePool;
use tracing::warn;

// Helper to convert sqlx::Error to AppError with structured information
fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            // SQLite error codes: https://www.sqlite.org/rescode.html
            Some(code) => match code.as_ref() {
                "5" => AppError::Store(format!(
                    "Database locked (SQLITE_BUSY): {}",
                    db_err.message()
                )),
                "13" => AppError::Store(format!("Database full: {}", db_err.message())),
                other => AppError::Store(format!(
                    "Database error [{}]: {}",
                    other,
                    db_err.message()
                )),
            },
            None => AppError::Store(format!("Database error: {}", db_err.message())),
        },
        sqlx::Error::ColumnNotFound(col) => AppError::Store(format!("Column not found: {}", col)),
        // Connection, pool, protocol errors
        _ => AppError::Store(err.to_string()),
    }
}

const TERMINAL_STATES: &str = "('FINISHED', 'FAILED', 'CANCELLED')";

pub struct SqliteTransactionStore {
    pool: SqlitePool,
}

impl SqliteTransactionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// One corrupt row must not hide the rest of the history
fn decode_rows(rows: Vec<TransactionRow>) -> Vec<Transaction> {
    let mut found = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id.clone();
        match row.into_transaction() {
            Ok(txn) => found.push(txn),
            Err(e) => warn!(transaction_id = %id, error = %e, "Skipping undecodable row"),
        }
    }
    found
}

#[async_trait]
impl TransactionStore for SqliteTransactionStore {
    async fn save(&self, txn: &Transaction) -> Result<()> {
        let packages = serde_json::to_string(txn.packages())?;
        let pending_question = txn
            .pending_question
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let error = txn.error.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, kind, owner, packages,
                state, phase, progress_percent, status_message,
                pending_question, error,
                created_at, started_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                phase = excluded.phase,
                progress_percent = excluded.progress_percent,
                status_message = excluded.status_message,
                pending_question = excluded.pending_question,
                error = excluded.error,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at
            "#,
        )
        .bind(&txn.id)
        .bind(txn.kind.to_string())
        .bind(&txn.owner)
        .bind(packages)
        .bind(txn.state.to_string())
        .bind(txn.phase.map(|p| p.to_string()))
        .bind(i64::from(txn.progress_percent))
        .bind(&txn.status_message)
        .bind(pending_question)
        .bind(error)
        .bind(txn.created_at)
        .bind(txn.started_at)
        .bind(txn.finished_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn find_by_id(&self, id: &TransactionId) -> Result<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>("SELECT * FROM transactions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(TransactionRow::into_transaction).transpose()
    }

    async fn find_unfinished(&self) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT * FROM transactions WHERE state NOT IN {} ORDER BY created_at ASC",
            TERMINAL_STATES
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(decode_rows(rows))
    }

    async fn recent(&self, limit: u32) -> Result<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(decode_rows(rows))
    }

    async fn prune_finished_before(&self, cutoff_millis: i64) -> Result<u64> {
        let sql = format!(
            "DELETE FROM transactions WHERE state IN {} AND finished_at IS NOT NULL AND finished_at < ?",
            TERMINAL_STATES
        );
        let result = sqlx::query(&sql)
            .bind(cutoff_millis)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}

/// SQLite row representation
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: String,
    kind: String,
    owner: String,
    packages: String, // JSON object name -> mode
    state: String,
    phase: Option<String>,
    progress_percent: i64,
    status_message: Option<String>,
    pending_question: Option<String>, // JSON
    error: Option<String>,            // JSON
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
}

impl TransactionRow {
    fn into_transaction(self) -> Result<Transaction> {
        let kind: TransactionKind = self.kind.parse()?;
        let packages: PackageSet = serde_json::from_str(&self.packages)?;

        let mut txn = Transaction::new(self.id, self.created_at, self.owner, kind, packages)?;
        txn.state = self.state.parse::<TransactionState>()?;
        txn.phase = self.phase.as_deref().map(str::parse::<Phase>).transpose()?;
        txn.progress_percent = self.progress_percent.clamp(0, 100) as u8;
        txn.status_message = self.status_message;
        txn.pending_question = self
            .pending_question
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        txn.error = self.error.as_deref().map(serde_json::from_str).transpose()?;
        txn.started_at = self.started_at;
        txn.finished_at = self.finished_at;
        Ok(txn)
    }
}

//! Transaction handles.
//!
//! A `TransactionHandle` wraps one open database transaction. The handle is
//! shared by reference through the ambient context; only the call that
//! created it may finalize it, and finalization happens exactly once. The
//! second commit or rollback on the same handle fails with
//! `DbError::Transaction`.

use crate::error::{DbError, DbResult};
use crate::value::{RowToJson, Record, Value, bind_mysql, bind_postgres, bind_sqlite};
use sqlx::{MySql, Postgres, Sqlite, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Database-specific transaction wrapper.
pub enum DbTransaction {
    /// MySQL transaction
    MySql(Transaction<'static, MySql>),
    /// PostgreSQL transaction
    Postgres(Transaction<'static, Postgres>),
    /// SQLite transaction
    Sqlite(Transaction<'static, Sqlite>),
}

/// Outcome of a single statement execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Auto-generated key for INSERT statements, where the backend reports
    /// one (MySQL, SQLite).
    pub last_insert_id: Option<i64>,
}

impl DbTransaction {
    /// Commit the transaction.
    async fn commit(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::Sqlite(tx) => tx.commit().await.map_err(DbError::from),
        }
    }

    /// Rollback the transaction.
    async fn rollback(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::Sqlite(tx) => tx.rollback().await.map_err(DbError::from),
        }
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<ExecResult> {
        match self {
            DbTransaction::MySql(tx) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql(query, param);
                }
                let result = query.execute(&mut **tx).await.map_err(DbError::from)?;
                Ok(ExecResult {
                    rows_affected: result.rows_affected(),
                    last_insert_id: Some(result.last_insert_id() as i64),
                })
            }
            DbTransaction::Postgres(tx) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                let result = query.execute(&mut **tx).await.map_err(DbError::from)?;
                Ok(ExecResult {
                    rows_affected: result.rows_affected(),
                    last_insert_id: None,
                })
            }
            DbTransaction::Sqlite(tx) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let result = query.execute(&mut **tx).await.map_err(DbError::from)?;
                Ok(ExecResult {
                    rows_affected: result.rows_affected(),
                    last_insert_id: Some(result.last_insert_rowid()),
                })
            }
        }
    }

    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Record>> {
        match self {
            DbTransaction::MySql(tx) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql(query, param);
                }
                let rows = query.fetch_all(&mut **tx).await.map_err(DbError::from)?;
                Ok(rows.iter().map(|r| r.to_json_map()).collect())
            }
            DbTransaction::Postgres(tx) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                let rows = query.fetch_all(&mut **tx).await.map_err(DbError::from)?;
                Ok(rows.iter().map(|r| r.to_json_map()).collect())
            }
            DbTransaction::Sqlite(tx) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let rows = query.fetch_all(&mut **tx).await.map_err(DbError::from)?;
                Ok(rows.iter().map(|r| r.to_json_map()).collect())
            }
        }
    }
}

/// One open database transaction, shared by reference across a call chain.
///
/// Statements issued through the handle are serialized in issue order by the
/// inner lock. Terminal states are committed or rolled back; exactly one must
/// occur, exactly once.
pub struct TransactionHandle {
    id: String,
    inner: Mutex<Option<DbTransaction>>,
}

impl TransactionHandle {
    pub(crate) fn new(tx: DbTransaction) -> Self {
        let id = format!("tx_{}", uuid::Uuid::new_v4().simple());
        debug!(transaction_id = %id, "Transaction started");
        Self {
            id,
            inner: Mutex::new(Some(tx)),
        }
    }

    /// Unique identifier of this transaction.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the handle has already been committed or rolled back.
    pub async fn is_finalized(&self) -> bool {
        self.inner.lock().await.is_none()
    }

    /// Execute a statement within this transaction.
    pub(crate) async fn execute(&self, sql: &str, params: &[Value]) -> DbResult<ExecResult> {
        let mut guard = self.inner.lock().await;
        let tx = guard
            .as_mut()
            .ok_or_else(|| DbError::transaction("transaction is no longer active"))?;
        tx.execute(sql, params).await
    }

    /// Run a query within this transaction.
    pub(crate) async fn fetch_all(&self, sql: &str, params: &[Value]) -> DbResult<Vec<Record>> {
        let mut guard = self.inner.lock().await;
        let tx = guard
            .as_mut()
            .ok_or_else(|| DbError::transaction("transaction is no longer active"))?;
        tx.fetch_all(sql, params).await
    }

    /// Commit the transaction. Fails if the handle was already finalized.
    pub(crate) async fn commit(&self) -> DbResult<()> {
        let tx = self
            .inner
            .lock()
            .await
            .take()
            .ok_or_else(|| DbError::transaction("commit on an already finalized transaction"))?;
        tx.commit().await?;
        info!(transaction_id = %self.id, "Transaction committed");
        Ok(())
    }

    /// Roll back the transaction. Fails if the handle was already finalized.
    pub(crate) async fn rollback(&self) -> DbResult<()> {
        let tx = self
            .inner
            .lock()
            .await
            .take()
            .ok_or_else(|| DbError::transaction("rollback on an already finalized transaction"))?;
        tx.rollback().await?;
        info!(transaction_id = %self.id, "Transaction rolled back");
        Ok(())
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        // Abandoning a handle without finalizing it is a programming error;
        // the underlying driver transaction rolls back when dropped.
        if let Ok(guard) = self.inner.try_lock() {
            if guard.is_some() {
                warn!(
                    transaction_id = %self.id,
                    "Transaction handle dropped without commit or rollback"
                );
            }
        }
    }
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Callbacks fired after a `transaction()` block finalizes.
///
/// `on_success` runs after a successful commit (or, for nested calls, after
/// the callback succeeds); `on_error` runs after a rollback. Hooks are
/// infallible closures; a panic inside a hook propagates to the caller.
#[derive(Default)]
pub struct TransactionHooks {
    pub(crate) on_success: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) on_error: Option<Box<dyn FnOnce() + Send>>,
}

impl TransactionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the success hook.
    pub fn on_success(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Set the error hook.
    pub fn on_error(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for TransactionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHooks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

//! Migration runner.
//!
//! Keeps an append-only record of applied migrations and applies pending
//! ones in ascending name order, each inside its own transaction. A failure
//! rolls back the failing migration only and halts the run; the record stays
//! accurate as of the last success.

use crate::connection::ConnectionManager;
use crate::error::{DbError, DbResult};
use crate::metadata::AttributeType;
use crate::value::Value;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the migration record table.
pub const MIGRATIONS_TABLE: &str = "contentdb_migrations";

/// One named migration: an identifier and its ordered statements.
#[derive(Debug, Clone)]
pub struct Migration {
    pub name: String,
    pub statements: Vec<String>,
}

impl Migration {
    pub fn new(name: impl Into<String>, statements: Vec<impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }
}

/// Applies pending migrations against the migration record.
pub struct MigrationRunner {
    manager: Arc<ConnectionManager>,
}

impl MigrationRunner {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Create the migration record table when missing.
    pub async fn ensure_table(&self) -> DbResult<()> {
        let dialect = self.manager.dialect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} VARCHAR(255) PRIMARY KEY, {} {})",
            dialect.qualified_table(MIGRATIONS_TABLE),
            dialect.quote_ident("name"),
            dialect.quote_ident("applied_at"),
            dialect.column_type(AttributeType::DateTime),
        );
        self.manager.get_schema_connection(None).execute(&sql).await?;
        Ok(())
    }

    /// Names of migrations already applied, in ascending order.
    pub async fn applied(&self) -> DbResult<BTreeSet<String>> {
        let dialect = self.manager.dialect();
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            dialect.quote_ident("name"),
            dialect.qualified_table(MIGRATIONS_TABLE),
            dialect.quote_ident("name"),
        );
        let rows = self.manager.fetch_all(&sql, &[]).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("name").and_then(|v| v.as_str()))
            .map(String::from)
            .collect())
    }

    /// Apply every migration not yet recorded, in ascending name order.
    /// Returns the number of migrations applied; a failure halts the run.
    pub async fn run(&self, migrations: &[Migration]) -> DbResult<u32> {
        self.ensure_table().await?;
        let applied = self.applied().await?;

        let mut pending: Vec<&Migration> = migrations
            .iter()
            .filter(|m| !applied.contains(&m.name))
            .collect();
        pending.sort_by(|a, b| a.name.cmp(&b.name));

        if pending.is_empty() {
            info!("No pending migrations");
            return Ok(0);
        }

        let mut count = 0;
        for migration in pending {
            self.apply(migration).await?;
            count += 1;
        }
        info!(applied = count, "Migrations complete");
        Ok(count)
    }

    /// Apply one migration inside its own transaction.
    async fn apply(&self, migration: &Migration) -> DbResult<()> {
        let handle = Arc::new(self.manager.begin().await?);

        let result = self.apply_statements(&handle, migration).await;
        match result {
            Ok(()) => {
                handle.commit().await?;
                info!(migration = %migration.name, "Migration applied");
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = handle.rollback().await {
                    warn!(
                        migration = %migration.name,
                        error = %rollback_err,
                        "Rollback failed after migration error"
                    );
                }
                Err(DbError::migration(&migration.name, err.to_string()))
            }
        }
    }

    async fn apply_statements(
        &self,
        handle: &Arc<crate::transaction::TransactionHandle>,
        migration: &Migration,
    ) -> DbResult<()> {
        let schema_conn = self.manager.get_schema_connection(Some(handle.clone()));
        for statement in &migration.statements {
            schema_conn.execute(statement).await?;
        }

        // Record on the same transaction: a failed migration leaves no entry.
        let dialect = self.manager.dialect();
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES ({}, {})",
            dialect.qualified_table(MIGRATIONS_TABLE),
            dialect.quote_ident("name"),
            dialect.quote_ident("applied_at"),
            dialect.placeholder(1),
            dialect.placeholder(2),
        );
        handle
            .execute(
                &sql,
                &[
                    Value::String(migration.name.clone()),
                    Value::DateTime(Utc::now()),
                ],
            )
            .await?;
        Ok(())
    }
}

//! Schema provider.
//!
//! Computes the structural difference between the metadata registry and the
//! live database schema, and applies it. Destructive statements (dropping
//! tables or columns) run only under an explicit flag. Alterations are
//! detected by column presence; type changes are out of the diff's reach and
//! belong in migrations.

use crate::connection::ConnectionManager;
use crate::context::TransactionContext;
use crate::dialect::DialectKind;
use crate::error::{DbError, DbResult};
use crate::metadata::{Column, ColumnKind, Metadata, MetadataRegistry};
use crate::schema::migrations::MIGRATIONS_TABLE;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One table's live or desired column set.
#[derive(Debug, Clone)]
pub struct TableShape {
    pub name: String,
    pub columns: Vec<String>,
}

/// Column-level changes for one existing table.
#[derive(Debug, Clone)]
pub struct TableAlteration {
    pub table: String,
    pub added_columns: Vec<String>,
    pub removed_columns: Vec<String>,
}

/// Structural difference between registry and live schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaDiff {
    /// Tables present in the registry but missing from the database.
    pub added_tables: Vec<String>,
    /// Tables present in the database but unknown to the registry.
    pub removed_tables: Vec<String>,
    /// Existing tables whose column sets differ.
    pub altered_tables: Vec<TableAlteration>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.altered_tables.is_empty()
    }

    /// Whether applying this diff involves destructive statements.
    pub fn is_destructive(&self) -> bool {
        !self.removed_tables.is_empty()
            || self
                .altered_tables
                .iter()
                .any(|alteration| !alteration.removed_columns.is_empty())
    }
}

/// Diff/apply logic between the metadata registry and the live schema.
pub struct SchemaProvider {
    registry: Arc<MetadataRegistry>,
    manager: Arc<ConnectionManager>,
}

impl SchemaProvider {
    pub fn new(registry: Arc<MetadataRegistry>, manager: Arc<ConnectionManager>) -> Self {
        Self { registry, manager }
    }

    /// Desired table shapes, derived from the registry.
    fn desired_shapes(&self) -> BTreeMap<String, TableShape> {
        self.registry
            .iter()
            .map(|meta| {
                (
                    meta.table_name().to_string(),
                    TableShape {
                        name: meta.table_name().to_string(),
                        columns: meta.columns().iter().map(|c| c.name.clone()).collect(),
                    },
                )
            })
            .collect()
    }

    fn metadata_by_table(&self, table: &str) -> Option<Arc<Metadata>> {
        self.registry
            .iter()
            .find(|meta| meta.table_name() == table)
            .cloned()
    }

    /// Introspect the live schema into table shapes.
    pub async fn introspect(&self) -> DbResult<BTreeMap<String, TableShape>> {
        match self.manager.dialect().kind() {
            DialectKind::SQLite => self.introspect_sqlite().await,
            DialectKind::PostgreSQL => self.introspect_postgres().await,
            DialectKind::MySQL => self.introspect_mysql().await,
        }
    }

    async fn introspect_sqlite(&self) -> DbResult<BTreeMap<String, TableShape>> {
        let tables = self
            .manager
            .fetch_all(queries::sqlite::LIST_TABLES, &[])
            .await?;
        let mut shapes = BTreeMap::new();
        for row in tables {
            let Some(name) = row.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let columns = self
                .manager
                .fetch_all(
                    queries::sqlite::LIST_COLUMNS,
                    &[Value::String(name.to_string())],
                )
                .await?;
            shapes.insert(
                name.to_string(),
                TableShape {
                    name: name.to_string(),
                    columns: columns
                        .iter()
                        .filter_map(|c| c.get("name").and_then(|v| v.as_str()))
                        .map(String::from)
                        .collect(),
                },
            );
        }
        Ok(shapes)
    }

    async fn introspect_postgres(&self) -> DbResult<BTreeMap<String, TableShape>> {
        let schema = self
            .manager
            .dialect()
            .schema()
            .unwrap_or("public")
            .to_string();
        let tables = self
            .manager
            .fetch_all(
                queries::postgres::LIST_TABLES,
                &[Value::String(schema.clone())],
            )
            .await?;
        let columns = self
            .manager
            .fetch_all(queries::postgres::LIST_COLUMNS, &[Value::String(schema)])
            .await?;
        Ok(collect_shapes(&tables, &columns))
    }

    async fn introspect_mysql(&self) -> DbResult<BTreeMap<String, TableShape>> {
        let tables = self
            .manager
            .fetch_all(queries::mysql::LIST_TABLES, &[])
            .await?;
        let columns = self
            .manager
            .fetch_all(queries::mysql::LIST_COLUMNS, &[])
            .await?;
        Ok(collect_shapes(&tables, &columns))
    }

    /// Compute the diff between registry and live schema.
    pub async fn diff(&self) -> DbResult<SchemaDiff> {
        let desired = self.desired_shapes();
        let live = self.introspect().await?;

        let mut diff = SchemaDiff::default();
        for (name, shape) in &desired {
            match live.get(name) {
                None => diff.added_tables.push(name.clone()),
                Some(live_shape) => {
                    let live_columns: BTreeSet<&String> = live_shape.columns.iter().collect();
                    let desired_columns: BTreeSet<&String> = shape.columns.iter().collect();
                    let added: Vec<String> = shape
                        .columns
                        .iter()
                        .filter(|c| !live_columns.contains(c))
                        .cloned()
                        .collect();
                    let removed: Vec<String> = live_shape
                        .columns
                        .iter()
                        .filter(|c| !desired_columns.contains(c))
                        .cloned()
                        .collect();
                    if !added.is_empty() || !removed.is_empty() {
                        diff.altered_tables.push(TableAlteration {
                            table: name.clone(),
                            added_columns: added,
                            removed_columns: removed,
                        });
                    }
                }
            }
        }
        for name in live.keys() {
            if !desired.contains_key(name) && name != MIGRATIONS_TABLE {
                diff.removed_tables.push(name.clone());
            }
        }
        debug!(
            added = diff.added_tables.len(),
            removed = diff.removed_tables.len(),
            altered = diff.altered_tables.len(),
            "Computed schema diff"
        );
        Ok(diff)
    }

    /// Apply a computed diff. Additive statements always run; destructive
    /// statements (drops) run only under the explicit `destructive` flag and
    /// are skipped with a warning otherwise.
    pub async fn apply(&self, diff: &SchemaDiff, destructive: bool) -> DbResult<()> {
        if diff.is_empty() {
            return Ok(());
        }
        if diff.is_destructive() && !destructive {
            warn!(
                removed_tables = diff.removed_tables.len(),
                "Schema diff includes drops; skipped without the destructive flag"
            );
        }

        let conn = self
            .manager
            .get_schema_connection(TransactionContext::current());

        for table in &diff.added_tables {
            let meta = self.metadata_by_table(table).ok_or_else(|| {
                DbError::schema("table not described by the registry", table.clone())
            })?;
            let sql = self.create_table_sql(&meta);
            info!(table = %table, "Creating table");
            conn.execute(&sql).await?;
        }

        for alteration in &diff.altered_tables {
            let meta = self.metadata_by_table(&alteration.table).ok_or_else(|| {
                DbError::schema("table not described by the registry", alteration.table.clone())
            })?;
            for column in &alteration.added_columns {
                let sql = self.add_column_sql(&meta, column)?;
                info!(table = %alteration.table, column = %column, "Adding column");
                conn.execute(&sql).await?;
            }
            if destructive {
                for column in &alteration.removed_columns {
                    let dialect = self.manager.dialect();
                    let sql = format!(
                        "ALTER TABLE {} DROP COLUMN {}",
                        dialect.qualified_table(&alteration.table),
                        dialect.quote_ident(column)
                    );
                    info!(table = %alteration.table, column = %column, "Dropping column");
                    conn.execute(&sql).await?;
                }
            }
        }

        if destructive {
            for table in &diff.removed_tables {
                let sql = format!(
                    "DROP TABLE {}",
                    self.manager.dialect().qualified_table(table)
                );
                info!(table = %table, "Dropping table");
                conn.execute(&sql).await?;
            }
        }
        Ok(())
    }

    /// Diff and apply in one step.
    pub async fn sync(&self, destructive: bool) -> DbResult<()> {
        let diff = self.diff().await?;
        self.apply(&diff, destructive).await
    }

    fn create_table_sql(&self, meta: &Metadata) -> String {
        let dialect = self.manager.dialect();
        let columns = meta
            .columns()
            .iter()
            .map(|column| self.column_ddl(column, false))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            dialect.qualified_table(meta.table_name()),
            columns
        )
    }

    fn add_column_sql(&self, meta: &Metadata, column_name: &str) -> DbResult<String> {
        let column = meta.column(column_name).ok_or_else(|| {
            DbError::schema("column not described by the registry", column_name.to_string())
        })?;
        let dialect = self.manager.dialect();
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            dialect.qualified_table(meta.table_name()),
            self.column_ddl(column, true)
        ))
    }

    /// Column definition clause. `for_alter` relaxes constraints SQLite
    /// cannot add through ALTER TABLE.
    fn column_ddl(&self, column: &Column, for_alter: bool) -> String {
        let dialect = self.manager.dialect();
        let name = dialect.quote_ident(&column.name);
        match &column.kind {
            ColumnKind::PrimaryKey => format!("{} {}", name, dialect.primary_key_clause()),
            ColumnKind::Attribute(attr) => {
                let mut ddl = format!("{} {}", name, dialect.column_type(attr.kind));
                if attr.required && !for_alter {
                    ddl.push_str(" NOT NULL");
                }
                let skip_unique =
                    for_alter && dialect.kind() == DialectKind::SQLite;
                if attr.unique && !skip_unique {
                    ddl.push_str(" UNIQUE");
                }
                ddl
            }
            ColumnKind::Relation { target } => {
                let mut ddl = format!("{} {}", name, dialect.reference_column_type());
                if let Ok(target_meta) = self.registry.get(target) {
                    ddl.push_str(&format!(
                        " REFERENCES {}({})",
                        dialect.qualified_table(target_meta.table_name()),
                        dialect.quote_ident("id")
                    ));
                }
                ddl
            }
        }
    }
}

fn collect_shapes(
    tables: &[crate::value::Record],
    columns: &[crate::value::Record],
) -> BTreeMap<String, TableShape> {
    let mut shapes: BTreeMap<String, TableShape> = tables
        .iter()
        .filter_map(|row| row.get("table_name").and_then(|v| v.as_str()))
        .map(|name| {
            (
                name.to_string(),
                TableShape {
                    name: name.to_string(),
                    columns: Vec::new(),
                },
            )
        })
        .collect();
    for row in columns {
        let Some(table) = row.get("table_name").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(column) = row.get("column_name").and_then(|v| v.as_str()) else {
            continue;
        };
        if let Some(shape) = shapes.get_mut(table) {
            shape.columns.push(column.to_string());
        }
    }
    shapes
}

// =============================================================================
// SQL Query Templates
// =============================================================================

mod queries {
    pub mod sqlite {
        pub const LIST_TABLES: &str = r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#;

        pub const LIST_COLUMNS: &str = r#"
            SELECT name FROM pragma_table_info(?) ORDER BY cid
            "#;
    }

    pub mod postgres {
        pub const LIST_TABLES: &str = r#"
            SELECT table_name FROM information_schema.tables
            WHERE table_schema = $1 AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#;

        pub const LIST_COLUMNS: &str = r#"
            SELECT table_name, column_name FROM information_schema.columns
            WHERE table_schema = $1
            ORDER BY table_name, ordinal_position
            "#;
    }

    pub mod mysql {
        pub const LIST_TABLES: &str = r#"
            SELECT TABLE_NAME AS table_name FROM information_schema.tables
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
            "#;

        pub const LIST_COLUMNS: &str = r#"
            SELECT TABLE_NAME AS table_name, COLUMN_NAME AS column_name
            FROM information_schema.columns
            WHERE TABLE_SCHEMA = DATABASE()
            ORDER BY TABLE_NAME, ORDINAL_POSITION
            "#;
    }
}

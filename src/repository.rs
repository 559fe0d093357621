//! Entity manager and repositories.
//!
//! The `EntityManager` is the public CRUD surface. A `Repository` is the
//! per-entity view: each operation resolves metadata, observes the ambient
//! transaction context, and fires lifecycle events around execution. Entity
//! records never touch the connection directly; everything flows through
//! here.

use crate::connection::ConnectionManager;
use crate::error::{DbError, DbResult};
use crate::lifecycle::{Action, LifecycleBus, LifecycleEvent};
use crate::metadata::{ColumnKind, ID_COLUMN, Metadata, MetadataRegistry};
use crate::query::{QueryBuilder, QueryParams};
use crate::value::{Record, Value};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;

/// Produces per-entity repositories and query builders.
#[derive(Debug, Clone)]
pub struct EntityManager {
    registry: Arc<MetadataRegistry>,
    manager: Arc<ConnectionManager>,
    lifecycles: Arc<LifecycleBus>,
}

impl EntityManager {
    pub fn new(
        registry: Arc<MetadataRegistry>,
        manager: Arc<ConnectionManager>,
        lifecycles: Arc<LifecycleBus>,
    ) -> Self {
        Self {
            registry,
            manager,
            lifecycles,
        }
    }

    /// Get the repository for an entity UID. Fails with `UnknownModel` when
    /// the UID is not registered.
    pub fn repository(&self, uid: &str) -> DbResult<Repository> {
        let metadata = self.registry.get(uid)?;
        Ok(Repository {
            metadata,
            manager: self.manager.clone(),
            lifecycles: self.lifecycles.clone(),
        })
    }

    /// Get a query builder for an entity UID.
    pub fn query_builder(&self, uid: &str) -> DbResult<QueryBuilder> {
        let metadata = self.registry.get(uid)?;
        Ok(QueryBuilder::new(metadata, self.manager.clone()))
    }
}

/// Per-entity CRUD and query operations.
pub struct Repository {
    metadata: Arc<Metadata>,
    manager: Arc<ConnectionManager>,
    lifecycles: Arc<LifecycleBus>,
}

impl Repository {
    /// UID of the entity this repository targets.
    pub fn uid(&self) -> &str {
        self.metadata.uid()
    }

    /// Lower-level query-builder escape hatch.
    pub fn query_builder(&self) -> QueryBuilder {
        QueryBuilder::new(self.metadata.clone(), self.manager.clone())
    }

    fn builder(&self, params: QueryParams) -> QueryBuilder {
        QueryBuilder::with_params(self.metadata.clone(), self.manager.clone(), params)
    }

    async fn emit_before(&self, action: Action, params: JsonValue) -> DbResult<()> {
        self.lifecycles
            .emit(LifecycleEvent::before(self.metadata.uid(), action, params))
            .await
    }

    async fn emit_after(&self, action: Action, params: JsonValue, result: JsonValue) -> DbResult<()> {
        self.lifecycles
            .emit(LifecycleEvent::after(
                self.metadata.uid(),
                action,
                params,
                result,
            ))
            .await
    }

    /// Find all records matching the query parameters.
    pub async fn find_many(&self, params: QueryParams) -> DbResult<Vec<Record>> {
        let params_json = to_params_json(&params)?;
        self.emit_before(Action::BeforeFindMany, params_json.clone())
            .await?;

        let records = self.builder(params).fetch_all().await?;

        self.emit_after(
            Action::AfterFindMany,
            params_json,
            JsonValue::Array(records.iter().cloned().map(JsonValue::Object).collect()),
        )
        .await?;
        Ok(records)
    }

    /// Find the first record matching the query parameters.
    pub async fn find_one(&self, params: QueryParams) -> DbResult<Option<Record>> {
        let params_json = to_params_json(&params)?;
        self.emit_before(Action::BeforeFindOne, params_json.clone())
            .await?;

        let record = self.builder(params).fetch_one().await?;

        self.emit_after(
            Action::AfterFindOne,
            params_json,
            record.clone().map(JsonValue::Object).unwrap_or(JsonValue::Null),
        )
        .await?;
        Ok(record)
    }

    /// Count records matching the query parameters.
    pub async fn count(&self, params: QueryParams) -> DbResult<u64> {
        let params_json = to_params_json(&params)?;
        self.emit_before(Action::BeforeCount, params_json.clone())
            .await?;

        let count = self.builder(params).count().await?;

        self.emit_after(Action::AfterCount, params_json, JsonValue::from(count))
            .await?;
        Ok(count)
    }

    /// Find a record by primary key.
    pub async fn find_by_id(&self, id: i64) -> DbResult<Option<Record>> {
        self.query_builder()
            .filter_eq(ID_COLUMN, JsonValue::from(id))
            .fetch_one()
            .await
    }

    /// Create a record and return the stored row.
    pub async fn create(&self, data: Record) -> DbResult<Record> {
        let data_json = JsonValue::Object(data.clone());
        self.emit_before(Action::BeforeCreate, data_json.clone())
            .await?;

        let columns = self.prepare_insert(&data)?;
        let record = self.insert_row(&columns).await?;

        self.emit_after(
            Action::AfterCreate,
            data_json,
            JsonValue::Object(record.clone()),
        )
        .await?;
        Ok(record)
    }

    /// Create several records, returning the stored rows in input order.
    pub async fn create_many(&self, data: Vec<Record>) -> DbResult<Vec<Record>> {
        let mut records = Vec::with_capacity(data.len());
        for entry in data {
            records.push(self.create(entry).await?);
        }
        Ok(records)
    }

    /// Update a record by primary key and return the stored row.
    pub async fn update(&self, id: i64, data: Record) -> DbResult<Record> {
        let data_json = JsonValue::Object(data.clone());
        self.emit_before(Action::BeforeUpdate, data_json.clone())
            .await?;

        let assignments = self.prepare_update(&data)?;
        if assignments.is_empty() {
            return Err(DbError::invalid_input("update payload has no known fields"));
        }

        let dialect = self.manager.dialect();
        let table = dialect.qualified_table(self.metadata.table_name());
        let mut args: Vec<Value> = Vec::with_capacity(assignments.len() + 1);
        let mut sets = Vec::with_capacity(assignments.len());
        for (column, value) in assignments {
            args.push(value);
            sets.push(format!(
                "{} = {}",
                dialect.quote_ident(&column),
                dialect.placeholder(args.len())
            ));
        }
        args.push(Value::Int(id));
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            table,
            sets.join(", "),
            dialect.quote_ident(ID_COLUMN),
            dialect.placeholder(args.len())
        );

        let conn = self.manager.get_connection(Some(self.metadata.table_name()));
        let result = conn.execute(&sql, &args).await?;
        if result.rows_affected == 0 {
            return Err(DbError::invalid_input(format!(
                "no '{}' record with id {}",
                self.metadata.uid(),
                id
            )));
        }

        let record = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| DbError::internal("updated row not found on re-read"))?;

        self.emit_after(
            Action::AfterUpdate,
            data_json,
            JsonValue::Object(record.clone()),
        )
        .await?;
        Ok(record)
    }

    /// Delete a record by primary key, returning the deleted row if it
    /// existed.
    pub async fn delete(&self, id: i64) -> DbResult<Option<Record>> {
        let params_json = serde_json::json!({ "id": id });
        self.emit_before(Action::BeforeDelete, params_json.clone())
            .await?;

        let existing = match self.find_by_id(id).await? {
            Some(record) => record,
            None => return Ok(None),
        };

        let dialect = self.manager.dialect();
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            dialect.qualified_table(self.metadata.table_name()),
            dialect.quote_ident(ID_COLUMN),
            dialect.placeholder(1)
        );
        let conn = self.manager.get_connection(Some(self.metadata.table_name()));
        conn.execute(&sql, &[Value::Int(id)]).await?;

        self.emit_after(
            Action::AfterDelete,
            params_json,
            JsonValue::Object(existing.clone()),
        )
        .await?;
        Ok(Some(existing))
    }

    /// Delete all records matching the query parameters, returning the
    /// number of deleted rows.
    pub async fn delete_many(&self, params: QueryParams) -> DbResult<u64> {
        let params_json = to_params_json(&params)?;
        self.emit_before(Action::BeforeDelete, params_json.clone())
            .await?;

        let (sql, args) = self.builder(params).build_delete()?;
        let conn = self.manager.get_connection(Some(self.metadata.table_name()));
        let result = conn.execute(&sql, &args).await?;

        self.emit_after(
            Action::AfterDelete,
            params_json,
            JsonValue::from(result.rows_affected),
        )
        .await?;
        Ok(result.rows_affected)
    }

    /// Validate and coerce an insert payload, applying metadata defaults.
    fn prepare_insert(&self, data: &Record) -> DbResult<Vec<(String, Value)>> {
        self.reject_unknown_fields(data)?;

        let mut columns = Vec::new();
        for column in self.metadata.columns() {
            match &column.kind {
                ColumnKind::PrimaryKey => {}
                ColumnKind::Attribute(attr) => {
                    if let Some(value) = data.get(&column.name) {
                        columns.push((column.name.clone(), Value::coerce(attr.kind, value)?));
                    } else if let Some(default) = &attr.default {
                        columns.push((column.name.clone(), Value::coerce(attr.kind, default)?));
                    } else if attr.required {
                        return Err(DbError::invalid_input(format!(
                            "missing required field '{}' on '{}'",
                            column.name,
                            self.metadata.uid()
                        )));
                    }
                }
                ColumnKind::Relation { .. } => {
                    if let Some(value) = data.get(&column.name) {
                        columns.push((column.name.clone(), Value::from_json(value)));
                    }
                }
            }
        }
        Ok(columns)
    }

    /// Validate and coerce an update payload; only provided fields change.
    fn prepare_update(&self, data: &Record) -> DbResult<Vec<(String, Value)>> {
        self.reject_unknown_fields(data)?;

        let mut assignments = Vec::new();
        for (name, value) in data {
            match self.metadata.column(name).map(|c| &c.kind) {
                Some(ColumnKind::Attribute(attr)) => {
                    assignments.push((name.clone(), Value::coerce(attr.kind, value)?));
                }
                Some(ColumnKind::Relation { .. }) => {
                    assignments.push((name.clone(), Value::from_json(value)));
                }
                _ => {}
            }
        }
        Ok(assignments)
    }

    fn reject_unknown_fields(&self, data: &Record) -> DbResult<()> {
        for name in data.keys() {
            if name == ID_COLUMN {
                return Err(DbError::invalid_input(format!(
                    "field '{ID_COLUMN}' is managed and cannot be written"
                )));
            }
            if self.metadata.column(name).is_none() {
                return Err(DbError::invalid_input(format!(
                    "unknown field '{}' on '{}'",
                    name,
                    self.metadata.uid()
                )));
            }
        }
        Ok(())
    }

    async fn insert_row(&self, columns: &[(String, Value)]) -> DbResult<Record> {
        let dialect = self.manager.dialect();
        let table = dialect.qualified_table(self.metadata.table_name());
        let conn = self.manager.get_connection(Some(self.metadata.table_name()));

        let args: Vec<Value> = columns.iter().map(|(_, v)| v.clone()).collect();
        let column_list = columns
            .iter()
            .map(|(name, _)| dialect.quote_ident(name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|n| dialect.placeholder(n))
            .collect::<Vec<_>>()
            .join(", ");

        let insert_sql = if columns.is_empty() {
            // An entity with only defaults can be created from an empty
            // payload; every backend accepts DEFAULT VALUES except MySQL.
            match dialect.kind() {
                crate::dialect::DialectKind::MySQL => format!("INSERT INTO {} () VALUES ()", table),
                _ => format!("INSERT INTO {} DEFAULT VALUES", table),
            }
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table, column_list, placeholders
            )
        };

        debug!(uid = %self.metadata.uid(), "Creating record");
        if dialect.supports_returning() {
            let sql = format!("{insert_sql} RETURNING *");
            let rows = conn.fetch_all(&sql, &args).await?;
            rows.into_iter()
                .next()
                .ok_or_else(|| DbError::internal("insert returned no row"))
        } else {
            let result = conn.execute(&insert_sql, &args).await?;
            let id = result
                .last_insert_id
                .ok_or_else(|| DbError::internal("backend reported no insert id"))?;
            self.find_by_id(id)
                .await?
                .ok_or_else(|| DbError::internal("inserted row not found on re-read"))
        }
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("uid", &self.metadata.uid())
            .finish_non_exhaustive()
    }
}

fn to_params_json(params: &QueryParams) -> DbResult<JsonValue> {
    serde_json::to_value(params)
        .map_err(|e| DbError::internal(format!("failed to serialize query params: {e}")))
}

//! Query building.
//!
//! Translates the abstract query shape (field equality, substring
//! containment, membership, ordering, pagination, projection) into the
//! dialect's SQL form. The builder is also the repository's lower-level
//! escape hatch: it executes through the connection manager and therefore
//! observes the ambient transaction.

use crate::connection::ConnectionManager;
use crate::dialect::Dialect;
use crate::error::{DbError, DbResult};
use crate::metadata::{ColumnKind, Metadata};
use crate::value::{Record, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// A single filter clause.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "op")]
pub enum Filter {
    /// Field equals value (NULL compares with IS NULL).
    Eq { field: String, value: JsonValue },
    /// Field contains the given substring.
    Contains { field: String, value: String },
    /// Field is one of the given values.
    In { field: String, values: Vec<JsonValue> },
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Abstract query parameters accepted by repository operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Vec<(String, SortOrder)>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
    /// Projection; all columns when absent.
    #[serde(default)]
    pub select: Option<Vec<String>>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Escape LIKE wildcards so a containment filter matches literally.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Per-entity query builder.
pub struct QueryBuilder {
    metadata: Arc<Metadata>,
    dialect: Dialect,
    manager: Arc<ConnectionManager>,
    params: QueryParams,
}

impl QueryBuilder {
    pub(crate) fn new(metadata: Arc<Metadata>, manager: Arc<ConnectionManager>) -> Self {
        let dialect = manager.dialect().clone();
        Self {
            metadata,
            dialect,
            manager,
            params: QueryParams::default(),
        }
    }

    pub(crate) fn with_params(
        metadata: Arc<Metadata>,
        manager: Arc<ConnectionManager>,
        params: QueryParams,
    ) -> Self {
        let mut builder = Self::new(metadata, manager);
        builder.params = params;
        builder
    }

    /// UID of the entity this builder targets.
    pub fn uid(&self) -> &str {
        self.metadata.uid()
    }

    pub fn filter_eq(mut self, field: impl Into<String>, value: JsonValue) -> Self {
        self.params.filters.push(Filter::Eq {
            field: field.into(),
            value,
        });
        self
    }

    pub fn filter_contains(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.filters.push(Filter::Contains {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn filter_in(mut self, field: impl Into<String>, values: Vec<JsonValue>) -> Self {
        self.params.filters.push(Filter::In {
            field: field.into(),
            values,
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.params.order_by.push((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.params.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.params.offset = Some(offset);
        self
    }

    pub fn select(mut self, columns: Vec<String>) -> Self {
        self.params.select = Some(columns);
        self
    }

    /// Resolve a filter/sort field to its quoted column, validating it
    /// against the entity's columns.
    fn column_ref(&self, field: &str) -> DbResult<String> {
        let column = self.metadata.column(field).ok_or_else(|| {
            DbError::invalid_input(format!(
                "unknown field '{}' on '{}'",
                field,
                self.metadata.uid()
            ))
        })?;
        Ok(self.dialect.quote_ident(&column.name))
    }

    /// Convert a filter value for a field, using the attribute type when the
    /// column is typed and falling back to structural conversion.
    fn filter_value(&self, field: &str, value: &JsonValue) -> DbResult<Value> {
        match self.metadata.column(field).map(|c| &c.kind) {
            Some(ColumnKind::Attribute(attr)) => Value::coerce(attr.kind, value),
            _ => Ok(Value::from_json(value)),
        }
    }

    fn where_clause(&self, args: &mut Vec<Value>) -> DbResult<String> {
        if self.params.filters.is_empty() {
            return Ok(String::new());
        }
        let mut clauses = Vec::with_capacity(self.params.filters.len());
        for filter in &self.params.filters {
            match filter {
                Filter::Eq { field, value } => {
                    let column = self.column_ref(field)?;
                    if value.is_null() {
                        clauses.push(format!("{column} IS NULL"));
                    } else {
                        args.push(self.filter_value(field, value)?);
                        clauses.push(format!("{column} = {}", self.dialect.placeholder(args.len())));
                    }
                }
                Filter::Contains { field, value } => {
                    let column = self.column_ref(field)?;
                    args.push(Value::String(format!("%{}%", escape_like(value))));
                    clauses.push(format!(
                        "{column} LIKE {}{}",
                        self.dialect.placeholder(args.len()),
                        self.dialect.like_escape_clause()
                    ));
                }
                Filter::In { field, values } => {
                    let column = self.column_ref(field)?;
                    if values.is_empty() {
                        // Empty membership matches nothing.
                        clauses.push("1 = 0".to_string());
                        continue;
                    }
                    let mut placeholders = Vec::with_capacity(values.len());
                    for value in values {
                        args.push(self.filter_value(field, value)?);
                        placeholders.push(self.dialect.placeholder(args.len()));
                    }
                    clauses.push(format!("{column} IN ({})", placeholders.join(", ")));
                }
            }
        }
        Ok(format!(" WHERE {}", clauses.join(" AND ")))
    }

    fn projection(&self) -> DbResult<String> {
        match &self.params.select {
            Some(columns) if !columns.is_empty() => {
                let mut quoted = Vec::with_capacity(columns.len());
                for column in columns {
                    quoted.push(self.column_ref(column)?);
                }
                Ok(quoted.join(", "))
            }
            _ => Ok(self
                .metadata
                .columns()
                .iter()
                .map(|c| self.dialect.quote_ident(&c.name))
                .collect::<Vec<_>>()
                .join(", ")),
        }
    }

    fn order_clause(&self) -> DbResult<String> {
        if self.params.order_by.is_empty() {
            return Ok(String::new());
        }
        let mut parts = Vec::with_capacity(self.params.order_by.len());
        for (field, order) in &self.params.order_by {
            parts.push(format!("{} {}", self.column_ref(field)?, order.as_sql()));
        }
        Ok(format!(" ORDER BY {}", parts.join(", ")))
    }

    fn pagination_clause(&self) -> String {
        let mut out = String::new();
        if let Some(limit) = self.params.limit {
            out.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.params.offset {
            // MySQL requires LIMIT when OFFSET is present.
            if self.params.limit.is_none() {
                out.push_str(&format!(" LIMIT {}", i64::MAX));
            }
            out.push_str(&format!(" OFFSET {offset}"));
        }
        out
    }

    /// Build the SELECT statement and its bind values.
    pub fn build_select(&self) -> DbResult<(String, Vec<Value>)> {
        let mut args = Vec::new();
        let table = self.dialect.qualified_table(self.metadata.table_name());
        let sql = format!(
            "SELECT {} FROM {}{}{}{}",
            self.projection()?,
            table,
            self.where_clause(&mut args)?,
            self.order_clause()?,
            self.pagination_clause(),
        );
        Ok((sql, args))
    }

    /// Build the COUNT statement and its bind values.
    pub fn build_count(&self) -> DbResult<(String, Vec<Value>)> {
        let mut args = Vec::new();
        let table = self.dialect.qualified_table(self.metadata.table_name());
        let sql = format!(
            "SELECT COUNT(*) AS cnt FROM {}{}",
            table,
            self.where_clause(&mut args)?,
        );
        Ok((sql, args))
    }

    /// Build the DELETE statement and its bind values.
    pub(crate) fn build_delete(&self) -> DbResult<(String, Vec<Value>)> {
        let mut args = Vec::new();
        let table = self.dialect.qualified_table(self.metadata.table_name());
        let sql = format!(
            "DELETE FROM {}{}",
            table,
            self.where_clause(&mut args)?,
        );
        Ok((sql, args))
    }

    /// Run the query and return all matching rows.
    pub async fn fetch_all(&self) -> DbResult<Vec<Record>> {
        let (sql, args) = self.build_select()?;
        self.manager.fetch_all(&sql, &args).await
    }

    /// Run the query and return the first matching row, if any.
    pub async fn fetch_one(&self) -> DbResult<Option<Record>> {
        let (sql, args) = {
            let mut limited = self.params.clone();
            limited.limit = Some(1);
            QueryBuilder {
                metadata: self.metadata.clone(),
                dialect: self.dialect.clone(),
                manager: self.manager.clone(),
                params: limited,
            }
            .build_select()?
        };
        Ok(self.manager.fetch_all(&sql, &args).await?.into_iter().next())
    }

    /// Count matching rows.
    pub async fn count(&self) -> DbResult<u64> {
        let (sql, args) = self.build_count()?;
        let rows = self.manager.fetch_all(&sql, &args).await?;
        let count = rows
            .first()
            .and_then(|row| row.get("cnt"))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DbError::internal("count query returned no usable row"))?;
        Ok(count as u64)
    }
}

impl std::fmt::Debug for QueryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("uid", &self.metadata.uid())
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

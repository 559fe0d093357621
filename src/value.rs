//! Parameter values and row decoding.
//!
//! `Value` is the unified bind-parameter type; records travel as
//! `serde_json::Map` rows. Database-specific bind and decode code lives here
//! so the rest of the crate can stay backend-agnostic.

use crate::error::{DbError, DbResult};
use crate::metadata::AttributeType;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sqlx::mysql::{MySqlArguments, MySqlRow};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::types::Json;
use sqlx::{Column as _, MySql, Postgres, Row as _, Sqlite, TypeInfo as _};

/// A materialized entity row.
pub type Record = Map<String, JsonValue>;

/// A bind parameter for queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Timestamp value
    DateTime(DateTime<Utc>),
    /// JSON document
    Json(JsonValue),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::DateTime(_) => "datetime",
            Self::Json(_) => "json",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Convert an untyped JSON value into a bind parameter.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => Self::String(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    /// Convert a JSON value into a bind parameter for a typed attribute,
    /// validating shape along the way.
    pub fn coerce(kind: AttributeType, value: &JsonValue) -> DbResult<Self> {
        if value.is_null() {
            return Ok(Self::Null);
        }
        match kind {
            AttributeType::String | AttributeType::Text => match value {
                JsonValue::String(s) => Ok(Self::String(s.clone())),
                other => Err(type_mismatch("string", other)),
            },
            AttributeType::Integer | AttributeType::BigInteger => match value.as_i64() {
                Some(i) => Ok(Self::Int(i)),
                None => Err(type_mismatch("integer", value)),
            },
            AttributeType::Float => match value.as_f64() {
                Some(f) => Ok(Self::Float(f)),
                None => Err(type_mismatch("float", value)),
            },
            AttributeType::Boolean => match value {
                JsonValue::Bool(b) => Ok(Self::Bool(*b)),
                other => Err(type_mismatch("boolean", other)),
            },
            AttributeType::DateTime => match value {
                JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
                    .map(|dt| Self::DateTime(dt.with_timezone(&Utc)))
                    .map_err(|e| {
                        DbError::invalid_input(format!("invalid RFC 3339 datetime '{s}': {e}"))
                    }),
                other => Err(type_mismatch("datetime string", other)),
            },
            AttributeType::Json => Ok(Self::Json(value.clone())),
        }
    }
}

fn type_mismatch(expected: &str, got: &JsonValue) -> DbError {
    DbError::invalid_input(format!("expected {expected}, got {got}"))
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Parameter Binding
// =============================================================================

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    value: &'q Value,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::String(v) => query.bind(v.as_str()),
        Value::DateTime(v) => query.bind(*v),
        Value::Json(v) => query.bind(Json(v)),
        Value::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::String(v) => query.bind(v.as_str()),
        Value::DateTime(v) => query.bind(*v),
        Value::Json(v) => query.bind(Json(v)),
        Value::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::String(v) => query.bind(v.as_str()),
        Value::DateTime(v) => query.bind(*v),
        // SQLite doesn't have a native JSON type, store as string
        Value::Json(v) => query.bind(v.to_string()),
        Value::Bytes(v) => query.bind(v.as_slice()),
    }
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Convert database rows into JSON maps.
pub(crate) trait RowToJson {
    fn to_json_map(&self) -> Record;
}

fn opt_json<T: Into<JsonValue>>(res: Result<Option<T>, sqlx::Error>) -> JsonValue {
    res.ok().flatten().map(Into::into).unwrap_or(JsonValue::Null)
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> Record {
        let mut map = Record::new();
        for (i, col) in self.columns().iter().enumerate() {
            let type_name = col.type_info().name().to_uppercase();
            let value = match type_name.as_str() {
                "INTEGER" | "INT" | "BIGINT" => opt_json(self.try_get::<Option<i64>, _>(i)),
                "BOOLEAN" | "BOOL" => opt_json(self.try_get::<Option<bool>, _>(i)),
                "REAL" | "DOUBLE" | "FLOAT" | "NUMERIC" => {
                    opt_json(self.try_get::<Option<f64>, _>(i))
                }
                "BLOB" => self
                    .try_get::<Option<Vec<u8>>, _>(i)
                    .ok()
                    .flatten()
                    .map(|b| JsonValue::String(STANDARD.encode(b)))
                    .unwrap_or(JsonValue::Null),
                "NULL" => JsonValue::Null,
                _ => opt_json(self.try_get::<Option<String>, _>(i)),
            };
            map.insert(col.name().to_string(), value);
        }
        map
    }
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> Record {
        let mut map = Record::new();
        for (i, col) in self.columns().iter().enumerate() {
            let type_name = col.type_info().name().to_uppercase();
            let value = match type_name.as_str() {
                "INT2" => opt_json(self.try_get::<Option<i16>, _>(i)),
                "INT4" => opt_json(self.try_get::<Option<i32>, _>(i)),
                "INT8" => opt_json(self.try_get::<Option<i64>, _>(i)),
                "FLOAT4" => opt_json(self.try_get::<Option<f32>, _>(i)),
                "FLOAT8" => opt_json(self.try_get::<Option<f64>, _>(i)),
                "BOOL" => opt_json(self.try_get::<Option<bool>, _>(i)),
                "JSON" | "JSONB" => self
                    .try_get::<Option<JsonValue>, _>(i)
                    .ok()
                    .flatten()
                    .unwrap_or(JsonValue::Null),
                "TIMESTAMPTZ" => self
                    .try_get::<Option<DateTime<Utc>>, _>(i)
                    .ok()
                    .flatten()
                    .map(|v| JsonValue::String(v.to_rfc3339()))
                    .unwrap_or(JsonValue::Null),
                "TIMESTAMP" => self
                    .try_get::<Option<NaiveDateTime>, _>(i)
                    .ok()
                    .flatten()
                    .map(|v| JsonValue::String(v.to_string()))
                    .unwrap_or(JsonValue::Null),
                "DATE" => self
                    .try_get::<Option<NaiveDate>, _>(i)
                    .ok()
                    .flatten()
                    .map(|v| JsonValue::String(v.to_string()))
                    .unwrap_or(JsonValue::Null),
                "BYTEA" => self
                    .try_get::<Option<Vec<u8>>, _>(i)
                    .ok()
                    .flatten()
                    .map(|b| JsonValue::String(STANDARD.encode(b)))
                    .unwrap_or(JsonValue::Null),
                _ => opt_json(self.try_get::<Option<String>, _>(i)),
            };
            map.insert(col.name().to_string(), value);
        }
        map
    }
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> Record {
        let mut map = Record::new();
        for (i, col) in self.columns().iter().enumerate() {
            let type_name = col.type_info().name().to_uppercase();
            let value = match type_name.as_str() {
                "BOOLEAN" | "BOOL" | "TINYINT(1)" => opt_json(self.try_get::<Option<bool>, _>(i)),
                t if t.contains("INT") && t.contains("UNSIGNED") => {
                    opt_json(self.try_get::<Option<u64>, _>(i))
                }
                t if t.contains("INT") => opt_json(self.try_get::<Option<i64>, _>(i)),
                "FLOAT" | "DOUBLE" => opt_json(self.try_get::<Option<f64>, _>(i)),
                "JSON" => self
                    .try_get::<Option<JsonValue>, _>(i)
                    .ok()
                    .flatten()
                    .unwrap_or(JsonValue::Null),
                "DATETIME" => self
                    .try_get::<Option<NaiveDateTime>, _>(i)
                    .ok()
                    .flatten()
                    .map(|v| JsonValue::String(v.to_string()))
                    .unwrap_or(JsonValue::Null),
                "TIMESTAMP" => self
                    .try_get::<Option<DateTime<Utc>>, _>(i)
                    .ok()
                    .flatten()
                    .map(|v| JsonValue::String(v.to_rfc3339()))
                    .unwrap_or(JsonValue::Null),
                "DATE" => self
                    .try_get::<Option<NaiveDate>, _>(i)
                    .ok()
                    .flatten()
                    .map(|v| JsonValue::String(v.to_string()))
                    .unwrap_or(JsonValue::Null),
                t if t.contains("BLOB") || t.contains("BINARY") => self
                    .try_get::<Option<Vec<u8>>, _>(i)
                    .ok()
                    .flatten()
                    .map(|b| JsonValue::String(STANDARD.encode(b)))
                    .unwrap_or(JsonValue::Null),
                _ => opt_json(self.try_get::<Option<String>, _>(i)),
            };
            map.insert(col.name().to_string(), value);
        }
        map
    }
}

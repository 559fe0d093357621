//! Dialect adapter.
//!
//! Normalizes per-backend SQL syntax and capabilities: identifier quoting,
//! placeholder style, schema qualification, column type mapping. The dialect
//! is configured from the connection URL before the pool is established, so
//! capability flags are available while the connection initializes, and is
//! immutable afterwards.

use crate::config::ConnectionConfig;
use crate::error::{DbError, DbResult};
use crate::metadata::AttributeType;
use serde::{Deserialize, Serialize};

/// Supported backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DialectKind {
    /// Detect the backend kind from a connection URL.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this backend kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DialectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A configured dialect: backend kind plus negotiated capabilities.
#[derive(Debug, Clone)]
pub struct Dialect {
    kind: DialectKind,
    schema: Option<String>,
}

impl Dialect {
    /// Configure the dialect from the connection settings. This happens
    /// before the pool is created; the capability flags below drive how the
    /// connection is initialized and how statements are generated.
    pub fn configure(config: &ConnectionConfig) -> DbResult<Self> {
        let kind = DialectKind::from_connection_string(&config.url).ok_or_else(|| {
            DbError::connection(
                format!("Unrecognized connection URL scheme: {}", config.masked_url()),
                "Use a postgres://, mysql://, or sqlite: URL",
            )
        })?;

        let schema = match (kind, &config.schema) {
            (DialectKind::PostgreSQL, Some(s)) => Some(s.clone()),
            (_, Some(s)) => {
                return Err(DbError::schema(
                    format!("{} does not support a configured schema", kind),
                    s.clone(),
                ));
            }
            (_, None) => None,
        };

        Ok(Self { kind, schema })
    }

    pub fn kind(&self) -> DialectKind {
        self.kind
    }

    /// The configured non-default schema, if any.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Whether the backend supports named schemas.
    pub fn supports_schemas(&self) -> bool {
        self.kind == DialectKind::PostgreSQL
    }

    /// Whether the backend supports `INSERT ... RETURNING`.
    pub fn supports_returning(&self) -> bool {
        matches!(self.kind, DialectKind::PostgreSQL | DialectKind::SQLite)
    }

    /// Whether DDL statements participate in transactions. MySQL commits
    /// implicitly around DDL, so schema changes there are executed directly.
    pub fn supports_transactional_ddl(&self) -> bool {
        matches!(self.kind, DialectKind::PostgreSQL | DialectKind::SQLite)
    }

    /// Quote an identifier for this backend.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self.kind {
            DialectKind::MySQL => format!("`{}`", ident.replace('`', "``")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Placeholder for the `n`-th bound parameter (1-based).
    pub fn placeholder(&self, n: usize) -> String {
        match self.kind {
            DialectKind::PostgreSQL => format!("${}", n),
            _ => "?".to_string(),
        }
    }

    /// Quote a table reference, schema-qualified when a non-default schema is
    /// configured.
    pub fn qualified_table(&self, table: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", self.quote_ident(schema), self.quote_ident(table)),
            None => self.quote_ident(table),
        }
    }

    /// ESCAPE clause appended to LIKE patterns that were escaped with a
    /// backslash. MySQL already treats backslash as the escape character.
    pub fn like_escape_clause(&self) -> &'static str {
        match self.kind {
            DialectKind::MySQL => "",
            _ => " ESCAPE '\\'",
        }
    }

    /// Whether this backend supports the given attribute type.
    pub fn supports_type(&self, _kind: AttributeType) -> bool {
        // All current backends cover the full attribute set; the hook stays so
        // registry validation has a single capability gate.
        true
    }

    /// Column type for an attribute.
    pub fn column_type(&self, kind: AttributeType) -> &'static str {
        match (self.kind, kind) {
            (_, AttributeType::String) => "VARCHAR(255)",
            (_, AttributeType::Text) => "TEXT",
            (_, AttributeType::Integer) => "INTEGER",
            (_, AttributeType::BigInteger) => "BIGINT",
            (DialectKind::PostgreSQL, AttributeType::Float) => "DOUBLE PRECISION",
            (DialectKind::MySQL, AttributeType::Float) => "DOUBLE",
            (DialectKind::SQLite, AttributeType::Float) => "REAL",
            (_, AttributeType::Boolean) => "BOOLEAN",
            (DialectKind::PostgreSQL, AttributeType::DateTime) => "TIMESTAMPTZ",
            (DialectKind::MySQL, AttributeType::DateTime) => "DATETIME",
            (DialectKind::SQLite, AttributeType::DateTime) => "TEXT",
            (DialectKind::PostgreSQL, AttributeType::Json) => "JSONB",
            (DialectKind::MySQL, AttributeType::Json) => "JSON",
            (DialectKind::SQLite, AttributeType::Json) => "TEXT",
        }
    }

    /// Primary key column definition for the implicit `id` column.
    pub fn primary_key_clause(&self) -> &'static str {
        match self.kind {
            DialectKind::PostgreSQL => "BIGSERIAL PRIMARY KEY",
            DialectKind::MySQL => "BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY",
            DialectKind::SQLite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }

    /// Column type used for foreign key reference columns.
    pub fn reference_column_type(&self) -> &'static str {
        match self.kind {
            DialectKind::SQLite => "INTEGER",
            _ => "BIGINT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;

    fn dialect_for(url: &str) -> Dialect {
        let config = ConnectionConfig::parse(url).unwrap();
        Dialect::configure(&config).unwrap()
    }

    #[test]
    fn test_kind_detection() {
        assert_eq!(
            DialectKind::from_connection_string("postgres://h/db"),
            Some(DialectKind::PostgreSQL)
        );
        assert_eq!(
            DialectKind::from_connection_string("postgresql://h/db"),
            Some(DialectKind::PostgreSQL)
        );
        assert_eq!(
            DialectKind::from_connection_string("mysql://h/db"),
            Some(DialectKind::MySQL)
        );
        assert_eq!(
            DialectKind::from_connection_string("sqlite:app.db"),
            Some(DialectKind::SQLite)
        );
        assert_eq!(DialectKind::from_connection_string("redis://h"), None);
    }

    #[test]
    fn test_quoting() {
        let pg = dialect_for("postgres://h/db");
        let my = dialect_for("mysql://h/db");
        assert_eq!(pg.quote_ident("articles"), "\"articles\"");
        assert_eq!(my.quote_ident("articles"), "`articles`");
        assert_eq!(my.quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_placeholders() {
        let pg = dialect_for("postgres://h/db");
        let lite = dialect_for("sqlite::memory:");
        assert_eq!(pg.placeholder(3), "$3");
        assert_eq!(lite.placeholder(3), "?");
    }

    #[test]
    fn test_schema_qualification_only_with_schema() {
        let plain = dialect_for("postgres://h/db");
        assert_eq!(plain.qualified_table("articles"), "\"articles\"");

        let config = ConnectionConfig::parse("postgres://h/db?schema=content").unwrap();
        let schemad = Dialect::configure(&config).unwrap();
        assert_eq!(
            schemad.qualified_table("articles"),
            "\"content\".\"articles\""
        );
    }

    #[test]
    fn test_schema_rejected_for_sqlite() {
        let config =
            ConnectionConfig::new("sqlite:app.db", Some("content".into()), PoolOptions::default())
                .unwrap();
        let err = Dialect::configure(&config).unwrap_err();
        assert!(matches!(err, DbError::Schema { .. }));
    }

    #[test]
    fn test_capabilities() {
        let pg = dialect_for("postgres://h/db");
        let my = dialect_for("mysql://h/db");
        let lite = dialect_for("sqlite::memory:");
        assert!(pg.supports_returning());
        assert!(lite.supports_returning());
        assert!(!my.supports_returning());
        assert!(pg.supports_transactional_ddl());
        assert!(!my.supports_transactional_ddl());
    }

    #[test]
    fn test_column_types() {
        let pg = dialect_for("postgres://h/db");
        let lite = dialect_for("sqlite::memory:");
        assert_eq!(pg.column_type(AttributeType::Json), "JSONB");
        assert_eq!(lite.column_type(AttributeType::Json), "TEXT");
        assert_eq!(pg.column_type(AttributeType::DateTime), "TIMESTAMPTZ");
    }
}

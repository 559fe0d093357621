//! Schema management.
//!
//! - `provider`: structural diff between the metadata registry and the live
//!   database schema, and its application.
//! - `migrations`: ordered, idempotent application of named migrations.

pub mod migrations;
pub mod provider;

pub use migrations::{MIGRATIONS_TABLE, Migration, MigrationRunner};
pub use provider::{SchemaDiff, SchemaProvider, TableAlteration};

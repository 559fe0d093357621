//! Integration tests for startup: migrations plus schema sync.

use contentdb::{
    AttributeDefinition, AttributeType, Database, DatabaseConfig, DatabaseSettings, DbError,
    EntityDefinition, Migration, MigrationRunner, QueryParams, Record,
};
use serde_json::json;
use std::collections::BTreeMap;

fn definitions() -> BTreeMap<String, EntityDefinition> {
    let mut attributes = BTreeMap::new();
    attributes.insert(
        "title".to_string(),
        AttributeDefinition::of_type(AttributeType::String).required(),
    );
    let mut defs = BTreeMap::new();
    defs.insert(
        "article".to_string(),
        EntityDefinition {
            table_name: Some("articles".to_string()),
            attributes,
            relations: BTreeMap::new(),
        },
    );
    defs
}

fn record(value: serde_json::Value) -> Record {
    value.as_object().unwrap().clone()
}

#[tokio::test]
async fn initialize_syncs_schema_and_applies_migrations() {
    let config = DatabaseConfig::from_url("sqlite::memory:").unwrap();
    let db = Database::new(config, definitions()).await.unwrap();

    let migrations = vec![Migration::new(
        "0001_create_audit_log",
        vec!["CREATE TABLE audit_log (id INTEGER PRIMARY KEY, entry TEXT)"],
    )];
    db.initialize(&migrations).await.unwrap();

    // Entity tables exist after sync.
    let repo = db.query("article").unwrap();
    repo.create(record(json!({ "title": "works" }))).await.unwrap();
    assert_eq!(repo.count(QueryParams::new()).await.unwrap(), 1);

    // The migration table exists too.
    db.connection()
        .execute("INSERT INTO audit_log (entry) VALUES ('x')", &[])
        .await
        .unwrap();
}

#[tokio::test]
async fn second_initialize_applies_zero_migrations() {
    let config = DatabaseConfig::from_url("sqlite::memory:").unwrap();
    let db = Database::new(config, definitions()).await.unwrap();

    let migrations = vec![
        Migration::new(
            "0001_first",
            vec!["CREATE TABLE first (id INTEGER PRIMARY KEY)"],
        ),
        Migration::new(
            "0002_second",
            vec!["CREATE TABLE second (id INTEGER PRIMARY KEY)"],
        ),
    ];

    let runner = MigrationRunner::new(db.connection().clone());
    db.initialize(&migrations).await.unwrap();
    assert_eq!(runner.applied().await.unwrap().len(), 2);

    // Idempotent: nothing pending on the second run.
    assert_eq!(runner.run(&migrations).await.unwrap(), 0);
    db.initialize(&migrations).await.unwrap();
    assert_eq!(runner.applied().await.unwrap().len(), 2);
}

#[tokio::test]
async fn failed_migration_halts_startup_and_keeps_prior_successes() {
    let config = DatabaseConfig::from_url("sqlite::memory:").unwrap();
    let db = Database::new(config, definitions()).await.unwrap();

    let migrations = vec![
        Migration::new(
            "0001_ok",
            vec!["CREATE TABLE ok_table (id INTEGER PRIMARY KEY)"],
        ),
        Migration::new("0002_broken", vec!["THIS IS NOT SQL"]),
    ];

    let err = db.initialize(&migrations).await.unwrap_err();
    assert!(matches!(err, DbError::Migration { .. }));

    let runner = MigrationRunner::new(db.connection().clone());
    let applied = runner.applied().await.unwrap();
    assert!(applied.contains("0001_ok"));
    assert!(!applied.contains("0002_broken"));
}

#[tokio::test]
async fn migration_record_persists_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("content.db").display());

    let migrations = vec![Migration::new(
        "0001_first",
        vec!["CREATE TABLE first (id INTEGER PRIMARY KEY)"],
    )];

    {
        let config = DatabaseConfig::from_url(&url).unwrap();
        let db = Database::new(config, definitions()).await.unwrap();
        db.initialize(&migrations).await.unwrap();
        db.destroy().await.unwrap();
    }

    // A fresh process over the same file sees the record and applies nothing.
    let config = DatabaseConfig::from_url(&url).unwrap();
    let db = Database::new(config, definitions()).await.unwrap();
    let runner = MigrationRunner::new(db.connection().clone());
    assert_eq!(runner.run(&migrations).await.unwrap(), 0);
}

#[tokio::test]
async fn force_migration_disabled_skips_pending_migrations() {
    let config = DatabaseConfig::from_url("sqlite::memory:")
        .unwrap()
        .with_settings(DatabaseSettings {
            force_migration: false,
        });
    let db = Database::new(config, definitions()).await.unwrap();

    let migrations = vec![Migration::new(
        "0001_skipped",
        vec!["CREATE TABLE skipped (id INTEGER PRIMARY KEY)"],
    )];
    db.initialize(&migrations).await.unwrap();

    // Schema still synced, migration intentionally not applied.
    let repo = db.query("article").unwrap();
    repo.create(record(json!({ "title": "synced" }))).await.unwrap();

    let err = db
        .connection()
        .execute("INSERT INTO skipped (id) VALUES (1)", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
}

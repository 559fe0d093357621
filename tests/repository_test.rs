//! Integration tests for the repository surface.

use contentdb::{
    AttributeDefinition, AttributeType, Database, DatabaseConfig, DbError, EntityDefinition,
    QueryParams, Record, RelationDefinition, RelationKind, SortOrder,
};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};

fn definitions() -> BTreeMap<String, EntityDefinition> {
    let mut attributes = BTreeMap::new();
    attributes.insert(
        "title".to_string(),
        AttributeDefinition::of_type(AttributeType::String).required(),
    );
    attributes.insert(
        "slug".to_string(),
        AttributeDefinition::of_type(AttributeType::String).unique(),
    );
    attributes.insert(
        "views".to_string(),
        AttributeDefinition::of_type(AttributeType::BigInteger).with_default(json!(0)),
    );
    attributes.insert(
        "published".to_string(),
        AttributeDefinition::of_type(AttributeType::Boolean).with_default(json!(false)),
    );
    let mut relations = BTreeMap::new();
    relations.insert(
        "author".to_string(),
        RelationDefinition {
            kind: RelationKind::ManyToOne,
            target: "author".to_string(),
        },
    );

    let mut author_attributes = BTreeMap::new();
    author_attributes.insert(
        "name".to_string(),
        AttributeDefinition::of_type(AttributeType::String).required(),
    );

    let mut defs = BTreeMap::new();
    defs.insert(
        "article".to_string(),
        EntityDefinition {
            table_name: Some("articles".to_string()),
            attributes,
            relations,
        },
    );
    defs.insert(
        "author".to_string(),
        EntityDefinition {
            table_name: Some("authors".to_string()),
            attributes: author_attributes,
            relations: BTreeMap::new(),
        },
    );
    defs
}

async fn database() -> Database {
    let config = DatabaseConfig::from_url("sqlite::memory:").unwrap();
    let db = Database::new(config, definitions()).await.unwrap();
    db.initialize(&[]).await.unwrap();
    db
}

fn record(value: serde_json::Value) -> Record {
    value.as_object().unwrap().clone()
}

#[tokio::test]
async fn unknown_uid_fails_with_unknown_model() {
    let db = database().await;
    let err = db.query("api::missing.missing").unwrap_err();
    assert!(matches!(err, DbError::UnknownModel { .. }));
    let err = db.query_builder("api::missing.missing").unwrap_err();
    assert!(matches!(err, DbError::UnknownModel { .. }));
}

#[tokio::test]
async fn create_applies_defaults_and_returns_stored_row() {
    let db = database().await;
    let repo = db.query("article").unwrap();

    let created = repo
        .create(record(json!({ "title": "Hello", "slug": "hello" })))
        .await
        .unwrap();

    assert_eq!(created["title"], json!("Hello"));
    assert_eq!(created["slug"], json!("hello"));
    assert_eq!(created["views"], json!(0));
    assert_eq!(created["published"], json!(false));
    assert!(created["id"].as_i64().is_some());
}

#[tokio::test]
async fn create_rejects_unknown_and_managed_fields() {
    let db = database().await;
    let repo = db.query("article").unwrap();

    let err = repo
        .create(record(json!({ "title": "x", "bogus": 1 })))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));

    let err = repo
        .create(record(json!({ "title": "x", "id": 7 })))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
}

#[tokio::test]
async fn create_rejects_missing_required_field() {
    let db = database().await;
    let repo = db.query("article").unwrap();
    let err = repo.create(record(json!({ "slug": "untitled" }))).await.unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert!(err.to_string().contains("title"));
}

#[tokio::test]
async fn create_rejects_type_mismatch() {
    let db = database().await;
    let repo = db.query("article").unwrap();
    let err = repo
        .create(record(json!({ "title": "x", "views": "many" })))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
}

#[tokio::test]
async fn contains_filter_is_substring_and_retry_safe() {
    let db = database().await;
    let repo = db.query("article").unwrap();
    for (title, slug) in [("A", "post"), ("B", "post-1"), ("C", "other")] {
        repo.create(record(json!({ "title": title, "slug": slug })))
            .await
            .unwrap();
    }

    let mut params = QueryParams::new();
    params.filters.push(contentdb::Filter::Contains {
        field: "slug".to_string(),
        value: "post".to_string(),
    });

    let first = repo.find_many(params.clone()).await.unwrap();
    assert_eq!(first.len(), 2);

    // Identical filters are side-effect free and safe to retry.
    let second = repo.find_many(params).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn unique_slug_finder_produces_distinct_values() {
    let db = database().await;
    let repo = db.query("article").unwrap();

    // Uniqueness-finder pattern: look at every slug containing the base,
    // then pick the first free suffix.
    async fn next_slug(repo: &contentdb::Repository, base: &str) -> String {
        let existing = repo
            .query_builder()
            .filter_contains("slug", base)
            .fetch_all()
            .await
            .unwrap();
        let taken: HashSet<String> = existing
            .iter()
            .filter_map(|r| r.get("slug").and_then(|v| v.as_str()))
            .map(String::from)
            .collect();
        if !taken.contains(base) {
            return base.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base}-{n}");
            if !taken.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    let slug = next_slug(&repo, "post").await;
    repo.create(record(json!({ "title": "first", "slug": slug })))
        .await
        .unwrap();

    let slug = next_slug(&repo, "post").await;
    repo.create(record(json!({ "title": "second", "slug": slug })))
        .await
        .unwrap();

    let stored: Vec<String> = repo
        .query_builder()
        .filter_contains("slug", "post")
        .order_by("slug", SortOrder::Asc)
        .fetch_all()
        .await
        .unwrap()
        .iter()
        .map(|r| r["slug"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(stored, vec!["post", "post-1"]);
}

#[tokio::test]
async fn update_changes_only_provided_fields() {
    let db = database().await;
    let repo = db.query("article").unwrap();
    let created = repo
        .create(record(json!({ "title": "Before", "slug": "before" })))
        .await
        .unwrap();
    let id = created["id"].as_i64().unwrap();

    let updated = repo
        .update(id, record(json!({ "title": "After" })))
        .await
        .unwrap();
    assert_eq!(updated["title"], json!("After"));
    assert_eq!(updated["slug"], json!("before"));

    let err = repo
        .update(9999, record(json!({ "title": "ghost" })))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
}

#[tokio::test]
async fn delete_returns_removed_row() {
    let db = database().await;
    let repo = db.query("article").unwrap();
    let created = repo
        .create(record(json!({ "title": "Gone", "slug": "gone" })))
        .await
        .unwrap();
    let id = created["id"].as_i64().unwrap();

    let deleted = repo.delete(id).await.unwrap().unwrap();
    assert_eq!(deleted["title"], json!("Gone"));
    assert!(repo.find_by_id(id).await.unwrap().is_none());

    // Deleting a missing row is not an error.
    assert!(repo.delete(id).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_many_removes_matching_rows() {
    let db = database().await;
    let repo = db.query("article").unwrap();
    for slug in ["a-post", "b-post", "other"] {
        repo.create(record(json!({ "title": slug, "slug": slug })))
            .await
            .unwrap();
    }

    let mut params = QueryParams::new();
    params.filters.push(contentdb::Filter::Contains {
        field: "slug".to_string(),
        value: "post".to_string(),
    });
    let removed = repo.delete_many(params).await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(repo.count(QueryParams::new()).await.unwrap(), 1);
}

#[tokio::test]
async fn count_and_pagination() {
    let db = database().await;
    let repo = db.query("article").unwrap();
    for n in 0..5 {
        repo.create(record(json!({ "title": format!("t{n}"), "slug": format!("s{n}") })))
            .await
            .unwrap();
    }

    assert_eq!(repo.count(QueryParams::new()).await.unwrap(), 5);

    let page = repo
        .query_builder()
        .order_by("slug", SortOrder::Asc)
        .limit(2)
        .offset(2)
        .fetch_all()
        .await
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0]["slug"], json!("s2"));
    assert_eq!(page[1]["slug"], json!("s3"));
}

#[tokio::test]
async fn create_many_preserves_input_order() {
    let db = database().await;
    let repo = db.query("article").unwrap();
    let created = repo
        .create_many(vec![
            record(json!({ "title": "one", "slug": "one" })),
            record(json!({ "title": "two", "slug": "two" })),
        ])
        .await
        .unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0]["title"], json!("one"));
    assert_eq!(created[1]["title"], json!("two"));
}

#[tokio::test]
async fn relation_column_accepts_target_id() {
    let db = database().await;
    let authors = db.query("author").unwrap();
    let articles = db.query("article").unwrap();

    let author = authors
        .create(record(json!({ "name": "sam" })))
        .await
        .unwrap();
    let author_id = author["id"].as_i64().unwrap();

    let created = articles
        .create(record(json!({
            "title": "linked",
            "slug": "linked",
            "author_id": author_id,
        })))
        .await
        .unwrap();
    assert_eq!(created["author_id"], json!(author_id));
}

#[tokio::test]
async fn operations_join_ambient_transaction() {
    let db = database().await;
    let repo = db.query("article").unwrap();

    let _ = db
        .transaction(|| async {
            repo.create(record(json!({ "title": "t", "slug": "tx" })))
                .await?;
            Err::<(), _>(DbError::invalid_input("abort"))
        })
        .await;

    // The create above joined the rolled-back transaction.
    assert_eq!(repo.count(QueryParams::new()).await.unwrap(), 0);

    db.transaction(|| async {
        repo.create(record(json!({ "title": "t", "slug": "tx" })))
            .await?;
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(repo.count(QueryParams::new()).await.unwrap(), 1);
}

//! Integration tests for lifecycle event dispatch.

use contentdb::{
    Action, AttributeDefinition, AttributeType, Database, DatabaseConfig, DbError,
    EntityDefinition, LifecycleBus, QueryParams, Record,
};
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

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
async fn before_and_after_events_fire_around_create() {
    let db = database().await;
    let log = Arc::new(Mutex::new(Vec::new()));

    let l = log.clone();
    db.lifecycles()
        .subscribe("article", Action::BeforeCreate, move |event| {
            let l = l.clone();
            async move {
                assert!(event.result.is_none());
                l.lock().unwrap().push("before");
                Ok(())
            }
        })
        .await;
    let l = log.clone();
    db.lifecycles()
        .subscribe("article", Action::AfterCreate, move |event| {
            let l = l.clone();
            async move {
                let result = event.result_record().expect("after event carries result");
                assert_eq!(result["title"], json!("Hello"));
                l.lock().unwrap().push("after");
                Ok(())
            }
        })
        .await;

    db.query("article")
        .unwrap()
        .create(record(json!({ "title": "Hello" })))
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["before", "after"]);
}

#[tokio::test]
async fn registration_order_is_dispatch_order() {
    let db = database().await;
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    db.lifecycles()
        .subscribe("article", Action::AfterCreate, move |_| {
            let o = o.clone();
            async move {
                o.lock().unwrap().push('A');
                Ok(())
            }
        })
        .await;
    let o = order.clone();
    db.lifecycles()
        .subscribe("article", Action::AfterCreate, move |_| {
            let o = o.clone();
            async move {
                o.lock().unwrap().push('B');
                Ok(())
            }
        })
        .await;

    db.query("article")
        .unwrap()
        .create(record(json!({ "title": "x" })))
        .await
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!['A', 'B']);
}

#[tokio::test]
async fn registration_order_is_deterministic_across_randomized_runs() {
    let mut rng = rand::thread_rng();

    for _ in 0..120 {
        let bus = LifecycleBus::new();
        let observed = Arc::new(Mutex::new(Vec::new()));

        let count = rng.gen_range(2..=6);
        let mut labels: Vec<usize> = (0..count).collect();
        labels.shuffle(&mut rng);

        for label in labels.clone() {
            let observed = observed.clone();
            bus.subscribe("article", Action::AfterUpdate, move |_| {
                let observed = observed.clone();
                async move {
                    observed.lock().unwrap().push(label);
                    Ok(())
                }
            })
            .await;
        }

        bus.emit(contentdb::LifecycleEvent {
            uid: "article".to_string(),
            action: Action::AfterUpdate,
            params: json!({}),
            result: None,
        })
        .await
        .unwrap();

        assert_eq!(*observed.lock().unwrap(), labels);
    }
}

#[tokio::test]
async fn subscriber_failure_surfaces_to_the_caller() {
    let db = database().await;
    db.lifecycles()
        .subscribe("article", Action::BeforeCreate, |_| async {
            Err(DbError::invalid_input("subscriber rejected"))
        })
        .await;

    let repo = db.query("article").unwrap();
    let err = repo
        .create(record(json!({ "title": "blocked" })))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("subscriber rejected"));

    // The failing before-event stopped the operation.
    assert_eq!(repo.count(QueryParams::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn destroy_clears_subscribers() {
    let db = database().await;
    db.lifecycles()
        .subscribe("article", Action::AfterCreate, |_| async { Ok(()) })
        .await;
    assert_eq!(db.lifecycles().count("article", Action::AfterCreate).await, 1);

    db.destroy().await.unwrap();
    assert_eq!(db.lifecycles().count("article", Action::AfterCreate).await, 0);
}

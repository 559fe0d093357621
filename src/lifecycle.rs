//! Lifecycle event bus.
//!
//! Publish/subscribe keyed by (entity UID, action). Subscribers run in
//! registration order, awaited sequentially; a subscriber failure surfaces to
//! the caller of the triggering entity operation. `clear()` deregisters
//! everything and is invoked during teardown.

use crate::error::DbResult;
use crate::value::Record;
use futures_util::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Actions around which lifecycle events fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    BeforeFindMany,
    AfterFindMany,
    BeforeFindOne,
    AfterFindOne,
    BeforeCount,
    AfterCount,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeCreate => "beforeCreate",
            Self::AfterCreate => "afterCreate",
            Self::BeforeUpdate => "beforeUpdate",
            Self::AfterUpdate => "afterUpdate",
            Self::BeforeDelete => "beforeDelete",
            Self::AfterDelete => "afterDelete",
            Self::BeforeFindMany => "beforeFindMany",
            Self::AfterFindMany => "afterFindMany",
            Self::BeforeFindOne => "beforeFindOne",
            Self::AfterFindOne => "afterFindOne",
            Self::BeforeCount => "beforeCount",
            Self::AfterCount => "afterCount",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload delivered to subscribers.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub uid: String,
    pub action: Action,
    /// Operation input: filters for reads, data for writes.
    pub params: JsonValue,
    /// Resolved result, present on `after*` events.
    pub result: Option<JsonValue>,
}

impl LifecycleEvent {
    pub(crate) fn before(uid: &str, action: Action, params: JsonValue) -> Self {
        Self {
            uid: uid.to_string(),
            action,
            params,
            result: None,
        }
    }

    pub(crate) fn after(uid: &str, action: Action, params: JsonValue, result: JsonValue) -> Self {
        Self {
            uid: uid.to_string(),
            action,
            params,
            result: Some(result),
        }
    }

    /// Convenience accessor for the result as a record.
    pub fn result_record(&self) -> Option<Record> {
        match &self.result {
            Some(JsonValue::Object(map)) => Some(map.clone()),
            _ => None,
        }
    }
}

type Subscriber = Arc<dyn Fn(LifecycleEvent) -> BoxFuture<'static, DbResult<()>> + Send + Sync>;

/// Publish/subscribe bus for entity lifecycle events.
pub struct LifecycleBus {
    subscribers: RwLock<HashMap<(String, Action), Vec<Subscriber>>>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber for (uid, action). Subscribers fire in
    /// registration order.
    pub async fn subscribe<F, Fut>(&self, uid: &str, action: Action, handler: F)
    where
        F: Fn(LifecycleEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        let subscriber: Subscriber = Arc::new(move |event| Box::pin(handler(event)));
        let mut subscribers = self.subscribers.write().await;
        subscribers
            .entry((uid.to_string(), action))
            .or_default()
            .push(subscriber);
    }

    /// Publish an event. Subscribers are awaited one at a time in
    /// registration order; the first failure stops dispatch and propagates.
    pub async fn emit(&self, event: LifecycleEvent) -> DbResult<()> {
        let matching: Vec<Subscriber> = {
            let subscribers = self.subscribers.read().await;
            match subscribers.get(&(event.uid.clone(), event.action)) {
                Some(list) => list.clone(),
                None => return Ok(()),
            }
        };

        debug!(
            uid = %event.uid,
            action = %event.action,
            subscribers = matching.len(),
            "Dispatching lifecycle event"
        );
        for subscriber in matching {
            subscriber(event.clone()).await?;
        }
        Ok(())
    }

    /// Number of subscribers registered for (uid, action).
    pub async fn count(&self, uid: &str, action: Action) -> usize {
        let subscribers = self.subscribers.read().await;
        subscribers
            .get(&(uid.to_string(), action))
            .map_or(0, |list| list.len())
    }

    /// Deregister all subscribers.
    pub async fn clear(&self) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.clear();
        debug!("All lifecycle subscribers cleared");
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_subscribers_fire_in_registration_order() {
        let bus = LifecycleBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        bus.subscribe("article", Action::AfterCreate, move |_| {
            let o = o.clone();
            async move {
                o.lock().unwrap().push("a");
                Ok(())
            }
        })
        .await;
        let o = order.clone();
        bus.subscribe("article", Action::AfterCreate, move |_| {
            let o = o.clone();
            async move {
                o.lock().unwrap().push("b");
                Ok(())
            }
        })
        .await;

        bus.emit(LifecycleEvent::before("article", Action::AfterCreate, json!({})))
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_subscriber_failure_propagates() {
        let bus = LifecycleBus::new();
        bus.subscribe("article", Action::BeforeCreate, |_| async {
            Err(DbError::invalid_input("nope"))
        })
        .await;

        let err = bus
            .emit(LifecycleEvent::before("article", Action::BeforeCreate, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_events_keyed_by_uid_and_action() {
        let bus = LifecycleBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        bus.subscribe("article", Action::AfterCreate, move |_| {
            let h = h.clone();
            async move {
                *h.lock().unwrap() += 1;
                Ok(())
            }
        })
        .await;

        // Different uid, different action: no dispatch.
        bus.emit(LifecycleEvent::before("page", Action::AfterCreate, json!({})))
            .await
            .unwrap();
        bus.emit(LifecycleEvent::before("article", Action::BeforeCreate, json!({})))
            .await
            .unwrap();
        assert_eq!(*hits.lock().unwrap(), 0);

        bus.emit(LifecycleEvent::before("article", Action::AfterCreate, json!({})))
            .await
            .unwrap();
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_removes_all_subscribers() {
        let bus = LifecycleBus::new();
        bus.subscribe("article", Action::AfterCreate, |_| async { Ok(()) })
            .await;
        assert_eq!(bus.count("article", Action::AfterCreate).await, 1);
        bus.clear().await;
        assert_eq!(bus.count("article", Action::AfterCreate).await, 0);
    }
}

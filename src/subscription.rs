//! Live queries.
//!
//! A view subscribes to a [`Query`] and receives full snapshots of its result
//! set whenever the underlying collection changes. Each (view, query) pair has
//! at most one active subscription; subscribing again replaces the previous
//! one. Dropping the [`Subscription`] handle stops the listener.

use crate::store::{Document, DocumentStore, Query};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub type Snapshot = Arc<Vec<Document>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    view: String,
    query: Query,
}

struct Registration {
    generation: u64,
    token: CancellationToken,
}

type Registry = Arc<Mutex<HashMap<SubscriptionKey, Registration>>>;

pub struct SubscriptionManager {
    store: Arc<dyn DocumentStore>,
    active: Registry,
    next_generation: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        SubscriptionManager {
            store,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, view: &str, query: Query) -> Subscription {
        let key = SubscriptionKey {
            view: view.to_string(),
            query: query.clone(),
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(None);

        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = active.insert(
                key.clone(),
                Registration {
                    generation,
                    token: token.clone(),
                },
            ) {
                tracing::debug!(view, collection = %query.collection, "replacing live query");
                previous.token.cancel();
            }
        }

        tracing::debug!(view, collection = %query.collection, "live query started");
        tokio::spawn(listen(self.store.clone(), query, tx, token.clone()));

        Subscription {
            key,
            generation,
            token,
            snapshots: rx,
            registry: self.active.clone(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_active(&self, view: &str, query: &Query) -> bool {
        let key = SubscriptionKey {
            view: view.to_string(),
            query: query.clone(),
        };
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&key)
    }
}

pub struct Subscription {
    key: SubscriptionKey,
    generation: u64,
    token: CancellationToken,
    snapshots: watch::Receiver<Option<Snapshot>>,
    registry: Registry,
}

impl Subscription {
    /// Waits for the next snapshot. Returns `None` once the subscription has
    /// been replaced or its listener stopped.
    pub async fn next(&mut self) -> Option<Snapshot> {
        loop {
            if self.snapshots.changed().await.is_err() {
                return None;
            }
            if let Some(snapshot) = self.snapshots.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
        let mut active = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        // a replacement may already own the slot
        if active
            .get(&self.key)
            .is_some_and(|r| r.generation == self.generation)
        {
            active.remove(&self.key);
            tracing::debug!(view = %self.key.view, collection = %self.key.query.collection, "live query stopped");
        }
    }
}

async fn listen(
    store: Arc<dyn DocumentStore>,
    query: Query,
    tx: watch::Sender<Option<Snapshot>>,
    token: CancellationToken,
) {
    // subscribe before the first read so no write slips between them
    let mut changes = store.changes();
    let mut last: Option<Vec<Document>> = None;

    publish(store.as_ref(), &query, &tx, &mut last).await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            change = changes.recv() => match change {
                Ok(collection) if collection == query.collection => {
                    publish(store.as_ref(), &query, &tx, &mut last).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, collection = %query.collection, "live query lagged, refreshing");
                    publish(store.as_ref(), &query, &tx, &mut last).await;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn publish(
    store: &dyn DocumentStore,
    query: &Query,
    tx: &watch::Sender<Option<Snapshot>>,
    last: &mut Option<Vec<Document>>,
) {
    match store.query(query).await {
        Ok(documents) => {
            // an echo of an optimistic write changes nothing
            if last.as_ref() == Some(&documents) {
                return;
            }
            tx.send_replace(Some(Arc::new(documents.clone())));
            *last = Some(documents);
        }
        Err(e) => {
            tracing::warn!(error = %e, collection = %query.collection, "live query refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Collections, LocalStore};
    use serde_json::json;
    use std::time::Duration;

    async fn setup() -> (Arc<LocalStore>, SubscriptionManager, Collections) {
        let store = Arc::new(LocalStore::in_memory().await.unwrap());
        let manager = SubscriptionManager::new(store.clone());
        (store, manager, Collections::new("test-app"))
    }

    #[tokio::test]
    async fn test_initial_snapshot_then_updates() {
        let (store, manager, c) = setup().await;
        store.set(&c.news(), "n1", json!({"title": "a"})).await.unwrap();

        let mut sub = manager.subscribe("home", Query::new(c.news()));
        let first = sub.next().await.unwrap();
        assert_eq!(first.len(), 1);

        store.set(&c.news(), "n2", json!({"title": "b"})).await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_other_collections_do_not_wake_listener() {
        let (store, manager, c) = setup().await;
        let mut sub = manager.subscribe("home", Query::new(c.news()));
        sub.next().await.unwrap();

        store.set(&c.posts(), "p1", json!({"content": "x"})).await.unwrap();
        let woke = tokio::time::timeout(Duration::from_millis(200), sub.next()).await;
        assert!(woke.is_err());
    }

    #[tokio::test]
    async fn test_identical_echo_is_not_republished() {
        let (store, manager, c) = setup().await;
        store
            .set(&c.devices(), "gate", json!({"is_open": true}))
            .await
            .unwrap();

        let mut sub = manager.subscribe("gate", Query::new(c.devices()));
        sub.next().await.unwrap();

        store
            .merge(&c.devices(), "gate", json!({"is_open": true}))
            .await
            .unwrap();
        let woke = tokio::time::timeout(Duration::from_millis(200), sub.next()).await;
        assert!(woke.is_err());
    }

    #[tokio::test]
    async fn test_one_subscription_per_view_and_query() {
        let (_store, manager, c) = setup().await;
        let query = Query::new(c.billing()).filter("resident_id", "r1");

        let mut first = manager.subscribe("bills", query.clone());
        let _second = manager.subscribe("bills", query.clone());
        assert_eq!(manager.active_count(), 1);

        // the replaced handle is closed
        let result = tokio::time::timeout(Duration::from_secs(2), async {
            while first.next().await.is_some() {}
        })
        .await;
        assert!(result.is_ok());

        let _other_view = manager.subscribe("dashboard", query.clone());
        assert_eq!(manager.active_count(), 2);

        // dropping the stale handle must not evict its replacement
        drop(first);
        assert!(manager.is_active("bills", &query));
    }

    #[tokio::test]
    async fn test_drop_releases_subscription() {
        let (_store, manager, c) = setup().await;
        let query = Query::new(c.events());

        let sub = manager.subscribe("events", query.clone());
        assert!(manager.is_active("events", &query));

        sub.unsubscribe();
        assert!(!manager.is_active("events", &query));
        assert_eq!(manager.active_count(), 0);
    }
}

//! Reactive data source abstraction.
//!
//! A Firestore-like document store: one-shot `get`/`set`/`update` plus live
//! queries that push a fresh snapshot on every relevant write.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use babble_core::{BabbleResult, RemoteError, SubscriptionError, ValidationError};
use serde_json::Value as JsonValue;

use crate::query::QueryDescriptor;
use crate::subscription::SnapshotSink;

/// Teardown handle for a live query opened on a data source.
///
/// Tearing down is idempotent; dropping the handle tears down too.
#[must_use = "dropping the subscription tears it down"]
pub struct UnderlyingSubscription {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl UnderlyingSubscription {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// A subscription with nothing to release.
    pub fn noop() -> Self {
        Self { teardown: None }
    }

    pub fn teardown(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for UnderlyingSubscription {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for UnderlyingSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnderlyingSubscription")
            .field("live", &self.teardown.is_some())
            .finish()
    }
}

/// Document store with live queries.
#[async_trait]
pub trait ReactiveDataSource: Send + Sync {
    /// Open a live query. Snapshots are pushed into `sink`, starting with
    /// the current result.
    fn subscribe(
        &self,
        query: &QueryDescriptor,
        sink: SnapshotSink<JsonValue>,
    ) -> Result<UnderlyingSubscription, SubscriptionError>;

    /// Read one document. A missing document is `Ok(None)`.
    async fn get(&self, path: &str) -> BabbleResult<Option<JsonValue>>;

    /// Replace one document.
    async fn set(&self, path: &str, value: JsonValue) -> BabbleResult<()>;

    /// Merge the top-level fields of `partial` into a document, creating it
    /// when absent.
    async fn update(&self, path: &str, partial: JsonValue) -> BabbleResult<()>;
}

// ============================================================================
// IN-MEMORY SOURCE
// ============================================================================

type Listeners = HashMap<u64, (QueryDescriptor, SnapshotSink<JsonValue>)>;

/// In-process [`ReactiveDataSource`].
///
/// Can be switched offline with [`set_available`](Self::set_available) to
/// exercise degraded paths.
#[derive(Default)]
pub struct InMemoryDataSource {
    documents: Mutex<BTreeMap<String, JsonValue>>,
    listeners: Arc<Mutex<Listeners>>,
    next_listener_id: AtomicU64,
    offline: AtomicBool,
    subscribe_calls: AtomicU64,
}

impl std::fmt::Debug for InMemoryDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDataSource")
            .field("documents", &self.documents().len())
            .field("listeners", &self.active_listeners())
            .field("offline", &self.offline.load(Ordering::Relaxed))
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing or regaining connectivity.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::Relaxed);
    }

    /// Live queries currently open.
    pub fn active_listeners(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Times `subscribe` has been called, successful or not.
    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls.load(Ordering::Relaxed)
    }

    fn documents(&self) -> MutexGuard<'_, BTreeMap<String, JsonValue>> {
        lock(&self.documents)
    }

    fn ensure_online(&self, operation: &str) -> BabbleResult<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(RemoteError::unavailable(operation, "data source offline").into());
        }
        Ok(())
    }

    fn ensure_path(path: &str) -> BabbleResult<()> {
        if path.is_empty() || path.split('/').any(str::is_empty) {
            return Err(ValidationError::InvalidPayload {
                field: "path".to_string(),
                reason: format!("malformed document path '{path}'"),
            }
            .into());
        }
        Ok(())
    }

    fn snapshot(documents: &BTreeMap<String, JsonValue>, query: &QueryDescriptor) -> JsonValue {
        query.evaluate(documents.iter().map(|(path, doc)| (path.as_str(), doc)))
    }

    /// Push fresh snapshots to every query watching `path`.
    fn publish(&self, path: &str) {
        let notifications: Vec<(SnapshotSink<JsonValue>, JsonValue)> = {
            let documents = self.documents();
            lock(&self.listeners)
                .values()
                .filter(|(query, _)| query.watches(path))
                .map(|(query, sink)| (sink.clone(), Self::snapshot(&documents, query)))
                .collect()
        };
        tracing::debug!(path, listeners = notifications.len(), "Publishing document change");
        for (sink, snapshot) in notifications {
            sink.emit(snapshot);
        }
    }
}

#[async_trait]
impl ReactiveDataSource for InMemoryDataSource {
    fn subscribe(
        &self,
        query: &QueryDescriptor,
        sink: SnapshotSink<JsonValue>,
    ) -> Result<UnderlyingSubscription, SubscriptionError> {
        self.subscribe_calls.fetch_add(1, Ordering::Relaxed);
        if self.offline.load(Ordering::Relaxed) {
            return Err(SubscriptionError::SetupFailed {
                key: query.cache_key(),
                reason: "data source offline".to_string(),
            });
        }

        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let initial = {
            let documents = self.documents();
            lock(&self.listeners).insert(id, (query.clone(), sink.clone()));
            Self::snapshot(&documents, query)
        };
        sink.emit(initial);

        let listeners = Arc::clone(&self.listeners);
        Ok(UnderlyingSubscription::new(move || {
            lock(&listeners).remove(&id);
        }))
    }

    async fn get(&self, path: &str) -> BabbleResult<Option<JsonValue>> {
        self.ensure_online("get")?;
        Self::ensure_path(path)?;
        Ok(self.documents().get(path).cloned())
    }

    async fn set(&self, path: &str, value: JsonValue) -> BabbleResult<()> {
        self.ensure_online("set")?;
        Self::ensure_path(path)?;
        self.documents().insert(path.to_string(), value);
        self.publish(path);
        Ok(())
    }

    async fn update(&self, path: &str, partial: JsonValue) -> BabbleResult<()> {
        self.ensure_online("update")?;
        Self::ensure_path(path)?;
        let JsonValue::Object(fields) = partial else {
            return Err(ValidationError::InvalidPayload {
                field: "partial".to_string(),
                reason: "update expects a JSON object".to_string(),
            }
            .into());
        };
        {
            let mut documents = self.documents();
            let document = documents
                .entry(path.to_string())
                .or_insert_with(|| JsonValue::Object(Default::default()));
            match document {
                JsonValue::Object(existing) => existing.extend(fields),
                other => *other = JsonValue::Object(fields),
            }
        }
        self.publish(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{SubscribeOptions, SubscriptionManager, SubscriptionUpdate};
    use babble_core::BabbleError;
    use babble_storage::KeyedCache;
    use serde_json::json;

    fn values(seen: &Arc<Mutex<Vec<SubscriptionUpdate<JsonValue>>>>) -> Vec<JsonValue> {
        seen.lock()
            .unwrap()
            .iter()
            .filter_map(|u| match u {
                SubscriptionUpdate::Value(v) => Some(v.clone()),
                SubscriptionUpdate::Error(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_get_set_update() {
        let source = InMemoryDataSource::new();
        assert_eq!(source.get("users/u1").await.unwrap(), None);

        source.set("users/u1", json!({"name": "Ana"})).await.unwrap();
        source.update("users/u1", json!({"preferredLanguage": "Spanish"})).await.unwrap();
        assert_eq!(
            source.get("users/u1").await.unwrap(),
            Some(json!({"name": "Ana", "preferredLanguage": "Spanish"}))
        );

        source.update("users/u2", json!({"preferredLanguage": "French"})).await.unwrap();
        assert_eq!(
            source.get("users/u2").await.unwrap(),
            Some(json!({"preferredLanguage": "French"}))
        );
    }

    #[tokio::test]
    async fn test_offline_source_fails_remote_calls() {
        let source = InMemoryDataSource::new();
        source.set_available(false);
        let err = source.get("users/u1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, BabbleError::Remote(RemoteError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_malformed_input_rejected() {
        let source = InMemoryDataSource::new();
        assert!(source.get("users//u1").await.is_err());
        assert!(source.update("users/u1", json!("Spanish")).await.is_err());
    }

    #[tokio::test]
    async fn test_live_query_through_manager() {
        let source: Arc<InMemoryDataSource> = Arc::new(InMemoryDataSource::new());
        source.set("presence/u1", json!({"online": false})).await.unwrap();

        let manager = SubscriptionManager::new(KeyedCache::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = manager
            .subscribe_query(
                source.clone(),
                QueryDescriptor::Presence { user_id: "u1".into() },
                move |update| sink.lock().unwrap().push(update.clone()),
                SubscribeOptions::default(),
            )
            .unwrap();

        source.update("presence/u1", json!({"online": true})).await.unwrap();
        source.set("presence/u2", json!({"online": true})).await.unwrap();

        assert_eq!(
            values(&seen),
            vec![
                json!({"id": "u1", "online": false}),
                json!({"id": "u1", "online": true}),
            ]
        );
        assert_eq!(
            manager.cache().get(&"presence:u1".to_string()),
            Some(json!({"id": "u1", "online": true}))
        );

        assert_eq!(source.active_listeners(), 1);
        drop(handle);
        assert_eq!(source.active_listeners(), 0);
    }

    #[tokio::test]
    async fn test_offline_subscribe_reports_error_then_recovers() {
        let source: Arc<InMemoryDataSource> = Arc::new(InMemoryDataSource::new());
        source.set_available(false);
        let manager = SubscriptionManager::new(KeyedCache::default());
        let query = QueryDescriptor::UserChats { user_id: "u1".into() };

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _first = manager
            .subscribe_query(
                source.clone(),
                query.clone(),
                move |update| sink.lock().unwrap().push(update.clone()),
                SubscribeOptions::default(),
            )
            .unwrap();
        assert!(matches!(
            seen.lock().unwrap().as_slice(),
            [SubscriptionUpdate::Error(SubscriptionError::SetupFailed { .. })]
        ));

        source.set_available(true);
        let _second = manager
            .subscribe_query(source.clone(), query, |_| {}, SubscribeOptions::default())
            .unwrap();
        assert_eq!(source.subscribe_calls(), 2);
        assert_eq!(values(&seen), vec![json!([])]);
    }
}

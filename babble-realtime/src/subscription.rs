//! Shared live subscriptions with cache replay.
//!
//! Many screens ask for the same live data (a chat list, a presence
//! document). The [`SubscriptionManager`] keeps at most one underlying
//! subscription per key, fans every update out to all attached subscribers
//! and writes values through to a [`KeyedCache`] so a later subscriber sees
//! the last known value before the source answers.
//!
//! # Delivery
//!
//! Updates for one record are queued and drained by a single deliverer, so
//! subscribers observe them in emission order even when an emission happens
//! from inside a subscriber callback. Callbacks never run under a lock.
//! Each subscriber carries an `active` flag checked before every callback;
//! once [`SubscriptionHandle::unsubscribe`] has returned, that subscriber is
//! not called again from the unsubscribing thread.
//!
//! # Failure
//!
//! If creating the underlying subscription fails, every attached subscriber
//! receives [`SubscriptionUpdate::Error`]. The record stays registered and
//! the next `subscribe` on the key retries creation. There is no background
//! retry.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use babble_core::{panic_message, BabbleResult, SubscriptionConfig, SubscriptionError, ValidationError};
use babble_storage::KeyedCache;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::query::QueryDescriptor;
use crate::source::{ReactiveDataSource, UnderlyingSubscription};

// ============================================================================
// OPTIONS AND UPDATES
// ============================================================================

/// Reconnection priority. Advisory only; ordering is `High` first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// Per-call subscription options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Write emitted values through to the manager's cache and replay
    /// cached values to new subscribers.
    pub cache: bool,
    /// Join an existing subscription for the same key instead of opening a
    /// new one.
    pub shared: bool,
    pub priority: SubscriptionPriority,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            cache: true,
            shared: true,
            priority: SubscriptionPriority::Normal,
        }
    }
}

impl SubscribeOptions {
    pub fn from_config(config: &SubscriptionConfig) -> Self {
        Self {
            cache: config.cache_by_default,
            shared: config.shared_by_default,
            priority: SubscriptionPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: SubscriptionPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.shared = false;
        self
    }

    pub fn uncached(mut self) -> Self {
        self.cache = false;
        self
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionUpdate<V> {
    Value(V),
    Error(SubscriptionError),
}

/// Counters describing the manager's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub active_records: usize,
    pub subscribers: usize,
    pub failed_records: usize,
    /// Underlying subscriptions created since the manager started.
    pub creations: u64,
    /// Underlying subscriptions torn down since the manager started.
    pub teardowns: u64,
}

// ============================================================================
// RECORDS
// ============================================================================

type Callback<V> = Arc<dyn Fn(&SubscriptionUpdate<V>) + Send + Sync>;

struct Subscriber<V> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback<V>,
}

impl<V> Clone for Subscriber<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: Arc::clone(&self.active),
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<V> Subscriber<V> {
    fn deliver(&self, key: &str, update: &SubscriptionUpdate<V>) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (self.callback)(update))) {
            tracing::error!(
                key,
                subscriber = self.id,
                panic = %panic_message(&*panic),
                "Subscriber callback panicked"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Creating,
    Live,
    Failed,
    Closed,
}

struct Delivery<V> {
    update: SubscriptionUpdate<V>,
    targets: Vec<Subscriber<V>>,
    write_cache: bool,
}

struct RecordState<V> {
    phase: Phase,
    priority: SubscriptionPriority,
    subscribers: Vec<Subscriber<V>>,
    underlying: Option<UnderlyingSubscription>,
    last: Option<V>,
    pending: VecDeque<Delivery<V>>,
    delivering: bool,
}

struct Record<V> {
    key: String,
    options: SubscribeOptions,
    state: Mutex<RecordState<V>>,
}

impl<V: Clone + Send + Sync + 'static> Record<V> {
    fn lock(&self) -> MutexGuard<'_, RecordState<V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a delivery. Returns true when the caller must drain.
    fn schedule(state: &mut RecordState<V>, delivery: Delivery<V>) -> bool {
        state.pending.push_back(delivery);
        if state.delivering {
            false
        } else {
            state.delivering = true;
            true
        }
    }

    fn drain(&self, cache: &KeyedCache<String, V>) {
        loop {
            let next = {
                let mut state = self.lock();
                match state.pending.pop_front() {
                    Some(delivery) => delivery,
                    None => {
                        state.delivering = false;
                        return;
                    }
                }
            };
            if let (true, SubscriptionUpdate::Value(value)) = (next.write_cache, &next.update) {
                cache.set(self.key.clone(), value.clone());
            }
            for subscriber in &next.targets {
                subscriber.deliver(&self.key, &next.update);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RecordKey {
    Shared(String),
    Exclusive(String, u64),
}

// ============================================================================
// SINK
// ============================================================================

/// Where an underlying subscription pushes its results.
///
/// Cheap to clone and safe to call from any thread. Calls after the record
/// was torn down are ignored.
pub struct SnapshotSink<V> {
    record: Weak<Record<V>>,
    manager: Weak<ManagerInner<V>>,
}

impl<V> Clone for SnapshotSink<V> {
    fn clone(&self) -> Self {
        Self {
            record: Weak::clone(&self.record),
            manager: Weak::clone(&self.manager),
        }
    }
}

impl<V> std::fmt::Debug for SnapshotSink<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotSink")
            .field("attached", &(self.record.strong_count() > 0))
            .finish()
    }
}

impl<V: Clone + Send + Sync + 'static> SnapshotSink<V> {
    /// A sink attached to nothing. Emissions are dropped.
    pub fn detached() -> Self {
        Self {
            record: Weak::new(),
            manager: Weak::new(),
        }
    }

    /// Whether the record this sink feeds is still live.
    pub fn is_attached(&self) -> bool {
        self.record
            .upgrade()
            .is_some_and(|record| record.lock().phase != Phase::Closed)
    }

    /// Push a new value to every subscriber.
    pub fn emit(&self, value: V) {
        let (Some(record), Some(manager)) = (self.record.upgrade(), self.manager.upgrade()) else {
            return;
        };
        let must_drain = {
            let mut state = record.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.last = Some(value.clone());
            let targets = state.subscribers.clone();
            Record::schedule(
                &mut state,
                Delivery {
                    update: SubscriptionUpdate::Value(value),
                    targets,
                    write_cache: record.options.cache,
                },
            )
        };
        if must_drain {
            record.drain(&manager.cache);
        }
    }

    /// Report a source-side error to every subscriber.
    ///
    /// The last value is kept and the subscription stays open.
    pub fn fail(&self, reason: impl Into<String>) {
        let (Some(record), Some(manager)) = (self.record.upgrade(), self.manager.upgrade()) else {
            return;
        };
        let error = SubscriptionError::Source {
            key: record.key.clone(),
            reason: reason.into(),
        };
        tracing::warn!(key = %record.key, error = %error, "Live subscription reported an error");
        let must_drain = {
            let mut state = record.lock();
            if state.phase == Phase::Closed {
                return;
            }
            let targets = state.subscribers.clone();
            Record::schedule(
                &mut state,
                Delivery {
                    update: SubscriptionUpdate::Error(error),
                    targets,
                    write_cache: false,
                },
            )
        };
        if must_drain {
            record.drain(&manager.cache);
        }
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// One subscriber's attachment. Dropping it unsubscribes.
#[must_use = "dropping the handle unsubscribes"]
pub struct SubscriptionHandle {
    key: String,
    active: Arc<AtomicBool>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Detach this subscriber. The last subscriber out tears the underlying
    /// subscription down.
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// MANAGER
// ============================================================================

struct ManagerInner<V> {
    records: Mutex<HashMap<RecordKey, Arc<Record<V>>>>,
    cache: KeyedCache<String, V>,
    next_id: AtomicU64,
    closed: AtomicBool,
    creations: AtomicU64,
    teardowns: AtomicU64,
}

impl<V> ManagerInner<V> {
    fn records(&self) -> MutexGuard<'_, HashMap<RecordKey, Arc<Record<V>>>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Deduplicating manager of live subscriptions.
///
/// Cloning is cheap; clones share state.
pub struct SubscriptionManager<V> {
    inner: Arc<ManagerInner<V>>,
}

impl<V> Clone for SubscriptionManager<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for SubscriptionManager<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("records", &self.inner.records().len())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<V: Clone + Send + Sync + 'static> SubscriptionManager<V> {
    /// Create a manager writing through to `cache`.
    pub fn new(cache: KeyedCache<String, V>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                records: Mutex::new(HashMap::new()),
                cache,
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                creations: AtomicU64::new(0),
                teardowns: AtomicU64::new(0),
            }),
        }
    }

    pub fn cache(&self) -> &KeyedCache<String, V> {
        &self.inner.cache
    }

    /// Attach `on_update` to the live data for `key`.
    ///
    /// `create_underlying` is only called when this call has to open the
    /// underlying subscription: no shared record exists, the existing one
    /// failed to open, or `options.shared` is false.
    pub fn subscribe<C, F>(
        &self,
        key: &str,
        create_underlying: C,
        on_update: F,
        options: SubscribeOptions,
    ) -> BabbleResult<SubscriptionHandle>
    where
        C: FnOnce(SnapshotSink<V>) -> Result<UnderlyingSubscription, SubscriptionError>,
        F: Fn(&SubscriptionUpdate<V>) + Send + Sync + 'static,
    {
        if key.is_empty() {
            return Err(ValidationError::EmptyKey.into());
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SubscriptionError::Closed.into());
        }

        let subscriber = Subscriber {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            active: Arc::new(AtomicBool::new(true)),
            callback: Arc::new(on_update) as Callback<V>,
        };
        // Read before taking any lock: an expired entry notifies cache listeners.
        let cached = if options.cache {
            self.inner.cache.get(&key.to_string())
        } else {
            None
        };

        let (record_key, record, needs_create, must_drain) = {
            let mut records = self.inner.records();
            let shared_key = RecordKey::Shared(key.to_string());
            let existing = if options.shared {
                records
                    .get(&shared_key)
                    .filter(|record| record.lock().phase != Phase::Closed)
                    .cloned()
            } else {
                None
            };

            match existing {
                Some(record) => {
                    let mut state = record.lock();
                    state.subscribers.push(subscriber.clone());
                    state.priority = state.priority.min(options.priority);
                    let needs_create = state.phase == Phase::Failed;
                    if needs_create {
                        state.phase = Phase::Creating;
                    }
                    let replay = state.last.clone().or(cached);
                    let must_drain = match replay {
                        Some(value) => Record::schedule(
                            &mut state,
                            Delivery {
                                update: SubscriptionUpdate::Value(value),
                                targets: vec![subscriber.clone()],
                                write_cache: false,
                            },
                        ),
                        None => false,
                    };
                    drop(state);
                    (shared_key, record, needs_create, must_drain)
                }
                None => {
                    let record_key = if options.shared {
                        shared_key
                    } else {
                        RecordKey::Exclusive(key.to_string(), subscriber.id)
                    };
                    let mut state = RecordState {
                        phase: Phase::Creating,
                        priority: options.priority,
                        subscribers: vec![subscriber.clone()],
                        underlying: None,
                        last: None,
                        pending: VecDeque::new(),
                        delivering: false,
                    };
                    let must_drain = match cached {
                        Some(value) => Record::schedule(
                            &mut state,
                            Delivery {
                                update: SubscriptionUpdate::Value(value),
                                targets: vec![subscriber.clone()],
                                write_cache: false,
                            },
                        ),
                        None => false,
                    };
                    let record = Arc::new(Record {
                        key: key.to_string(),
                        options,
                        state: Mutex::new(state),
                    });
                    records.insert(record_key.clone(), Arc::clone(&record));
                    tracing::debug!(key, shared = options.shared, "Opened subscription record");
                    (record_key, record, true, must_drain)
                }
            }
        };

        if must_drain {
            record.drain(&self.inner.cache);
        }
        if needs_create {
            self.create(&record, create_underlying);
        }

        let inner = Arc::downgrade(&self.inner);
        let detach_record = Arc::clone(&record);
        let subscriber_id = subscriber.id;
        Ok(SubscriptionHandle {
            key: key.to_string(),
            active: Arc::clone(&subscriber.active),
            detach: Some(Box::new(move || {
                detach(inner, &record_key, &detach_record, subscriber_id);
            })),
        })
    }

    fn create<C>(&self, record: &Arc<Record<V>>, create_underlying: C)
    where
        C: FnOnce(SnapshotSink<V>) -> Result<UnderlyingSubscription, SubscriptionError>,
    {
        let sink = SnapshotSink {
            record: Arc::downgrade(record),
            manager: Arc::downgrade(&self.inner),
        };
        self.inner.creations.fetch_add(1, Ordering::Relaxed);

        let outcome = match catch_unwind(AssertUnwindSafe(|| create_underlying(sink))) {
            Ok(outcome) => outcome,
            Err(panic) => Err(SubscriptionError::SetupFailed {
                key: record.key.clone(),
                reason: format!("setup panicked: {}", panic_message(&*panic)),
            }),
        };

        match outcome {
            Ok(underlying) => {
                let orphan = {
                    let mut state = record.lock();
                    if state.phase == Phase::Closed {
                        Some(underlying)
                    } else {
                        state.phase = Phase::Live;
                        state.underlying = Some(underlying);
                        None
                    }
                };
                if let Some(underlying) = orphan {
                    // Every subscriber left while the source was connecting.
                    underlying.teardown();
                    self.inner.teardowns.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %record.key, "Tore down subscription opened after close");
                } else {
                    tracing::debug!(key = %record.key, "Underlying subscription live");
                }
            }
            Err(error) => {
                let error = match error {
                    SubscriptionError::SetupFailed { .. } => error,
                    other => SubscriptionError::SetupFailed {
                        key: record.key.clone(),
                        reason: other.to_string(),
                    },
                };
                tracing::warn!(key = %record.key, error = %error, "Subscription setup failed");
                let must_drain = {
                    let mut state = record.lock();
                    if state.phase == Phase::Closed {
                        false
                    } else {
                        state.phase = Phase::Failed;
                        let targets = state.subscribers.clone();
                        Record::schedule(
                            &mut state,
                            Delivery {
                                update: SubscriptionUpdate::Error(error),
                                targets,
                                write_cache: false,
                            },
                        )
                    }
                };
                if must_drain {
                    record.drain(&self.inner.cache);
                }
            }
        }
    }

    /// Live keys ordered for reconnection: `High` first, then by key.
    pub fn keys_by_priority(&self) -> Vec<String> {
        let mut ranked: Vec<(SubscriptionPriority, String)> = self
            .inner
            .records()
            .values()
            .filter_map(|record| {
                let state = record.lock();
                (state.phase != Phase::Closed).then(|| (state.priority, record.key.clone()))
            })
            .collect();
        ranked.sort();
        let mut keys: Vec<String> = Vec::with_capacity(ranked.len());
        for (_, key) in ranked {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Keys with at least one live record, sorted.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .records()
            .values()
            .map(|record| record.key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Subscribers attached to `key` across shared and exclusive records.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner
            .records()
            .values()
            .filter(|record| record.key == key)
            .map(|record| record.lock().subscribers.len())
            .sum()
    }

    pub fn stats(&self) -> SubscriptionStats {
        let records = self.inner.records();
        let mut stats = SubscriptionStats {
            creations: self.inner.creations.load(Ordering::Relaxed),
            teardowns: self.inner.teardowns.load(Ordering::Relaxed),
            ..Default::default()
        };
        for record in records.values() {
            let state = record.lock();
            stats.active_records += 1;
            stats.subscribers += state.subscribers.len();
            if state.phase == Phase::Failed {
                stats.failed_records += 1;
            }
        }
        stats
    }

    /// Tear down every record and refuse new subscriptions.
    ///
    /// Attached subscribers are deactivated without a final update.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let records: Vec<Arc<Record<V>>> = self.inner.records().drain().map(|(_, r)| r).collect();
        let mut torn_down = 0usize;
        for record in records {
            let underlying = {
                let mut state = record.lock();
                state.phase = Phase::Closed;
                for subscriber in state.subscribers.drain(..) {
                    subscriber.active.store(false, Ordering::Release);
                }
                state.pending.clear();
                state.underlying.take()
            };
            if let Some(underlying) = underlying {
                underlying.teardown();
                self.inner.teardowns.fetch_add(1, Ordering::Relaxed);
                torn_down += 1;
            }
        }
        tracing::debug!(torn_down, "Subscription manager shut down");
    }
}

fn detach<V: Clone + Send + Sync + 'static>(
    inner: Weak<ManagerInner<V>>,
    record_key: &RecordKey,
    record: &Arc<Record<V>>,
    subscriber_id: u64,
) {
    let underlying = {
        let mut state = record.lock();
        state.subscribers.retain(|s| s.id != subscriber_id);
        if !state.subscribers.is_empty() || state.phase == Phase::Closed {
            return;
        }
        state.phase = Phase::Closed;
        state.pending.clear();
        state.underlying.take()
    };

    let inner = inner.upgrade();
    if let Some(inner) = &inner {
        let mut records = inner.records();
        if records
            .get(record_key)
            .is_some_and(|current| Arc::ptr_eq(current, record))
        {
            records.remove(record_key);
        }
    }

    if let Some(underlying) = underlying {
        underlying.teardown();
        if let Some(inner) = &inner {
            inner.teardowns.fetch_add(1, Ordering::Relaxed);
        }
    }
    tracing::debug!(key = %record.key, "Closed subscription record");
}

impl SubscriptionManager<JsonValue> {
    /// Subscribe to a query on `source`, keyed by the query's cache key.
    pub fn subscribe_query<F>(
        &self,
        source: Arc<dyn ReactiveDataSource>,
        query: QueryDescriptor,
        on_update: F,
        options: SubscribeOptions,
    ) -> BabbleResult<SubscriptionHandle>
    where
        F: Fn(&SubscriptionUpdate<JsonValue>) + Send + Sync + 'static,
    {
        let key = query.cache_key();
        self.subscribe(
            &key,
            move |sink| source.subscribe(&query, sink),
            on_update,
            options,
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

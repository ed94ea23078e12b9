//! `KeyedCache`: a concurrent map with lazy TTL expiry and per-key listeners.

use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use babble_core::clock::{expiry_after, Clock, SystemClock};
use babble_core::{panic_message, CacheConfig, Timestamp};
use dashmap::DashMap;

use super::stats::CacheStats;

/// A cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<K, V> {
    pub key: K,
    pub value: V,
    pub cached_at: Timestamp,
    /// `None` means the entry lives until invalidated.
    pub expires_at: Option<Timestamp>,
}

impl<K, V> CacheEntry<K, V> {
    /// An entry is expired from its `expires_at` instant onwards.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// What happened to a key.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent<V> {
    Updated(V),
    Invalidated,
    Expired,
}

/// Callback registered for one key.
pub type CacheListener<K, V> = Arc<dyn Fn(&K, &CacheEvent<V>) + Send + Sync>;

struct CacheInner<K, V> {
    entries: DashMap<K, CacheEntry<K, V>>,
    listeners: DashMap<K, Vec<(u64, CacheListener<K, V>)>>,
    next_listener_id: AtomicU64,
    clock: Arc<dyn Clock>,
    default_ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Eq + Hash, V> CacheInner<K, V> {
    fn remove_listener(&self, key: &K, id: u64) {
        if let Some(mut registered) = self.listeners.get_mut(key) {
            registered.retain(|(listener_id, _)| *listener_id != id);
        }
        self.listeners.remove_if(key, |_, registered| registered.is_empty());
    }
}

/// Concurrent keyed cache.
///
/// Cloning is cheap and every clone shares the same entries and listeners.
pub struct KeyedCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for KeyedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash, V> Debug for KeyedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedCache")
            .field("entries", &self.inner.entries.len())
            .field("listened_keys", &self.inner.listeners.len())
            .field("default_ttl", &self.inner.default_ttl)
            .finish_non_exhaustive()
    }
}

impl<K, V> Default for KeyedCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), None)
    }
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache reading time from `clock`.
    ///
    /// `default_ttl` applies to [`set`](Self::set); `None` keeps entries
    /// until they are invalidated.
    pub fn new(clock: Arc<dyn Clock>, default_ttl: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                listeners: DashMap::new(),
                next_listener_id: AtomicU64::new(0),
                clock,
                default_ttl,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// Create a cache using the configured default TTL.
    pub fn from_config(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, config.default_ttl())
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.inner.default_ttl
    }

    /// Get the live value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entry(key).map(|entry| entry.value)
    }

    /// Get the live entry for `key`.
    ///
    /// An entry found past its expiry is removed here and its listeners
    /// receive [`CacheEvent::Expired`].
    pub fn entry(&self, key: &K) -> Option<CacheEntry<K, V>> {
        let now = self.inner.clock.now();
        let current = self.inner.entries.get(key).map(|entry| entry.clone());
        match current {
            Some(entry) if !entry.is_expired_at(now) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(_) => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                self.expire(key, now);
                None
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `value` under the default TTL and notify listeners.
    pub fn set(&self, key: K, value: V) {
        self.insert(key, value, self.inner.default_ttl);
    }

    /// Store `value` for `ttl` and notify listeners.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.insert(key, value, Some(ttl));
    }

    fn insert(&self, key: K, value: V, ttl: Option<Duration>) {
        let now = self.inner.clock.now();
        let entry = CacheEntry {
            key: key.clone(),
            value: value.clone(),
            cached_at: now,
            expires_at: ttl.map(|ttl| expiry_after(now, ttl)),
        };
        self.inner.entries.insert(key.clone(), entry);
        self.notify(&key, &CacheEvent::Updated(value));
    }

    /// Remove `key`. Listeners are notified only if an entry was removed.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.inner.entries.remove(key).is_some();
        if removed {
            tracing::debug!(key = ?key, "Cache entry invalidated");
            self.notify(key, &CacheEvent::Invalidated);
        }
        removed
    }

    /// Invalidate every entry. Returns the number removed.
    pub fn clear(&self) -> usize {
        let keys: Vec<K> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|key| self.invalidate(key)).count()
    }

    /// Sweep expired entries. Returns the number purged.
    pub fn gc(&self) -> usize {
        let now = self.inner.clock.now();
        let expired: Vec<K> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.value().is_expired_at(now))
            .map(|e| e.key().clone())
            .collect();
        let purged = expired.iter().filter(|key| self.expire(key, now)).count();
        if purged > 0 {
            tracing::debug!(purged, "Cache sweep purged expired entries");
        }
        purged
    }

    // Only removes the entry if it is still expired; a concurrent `set` wins.
    fn expire(&self, key: &K, now: Timestamp) -> bool {
        let removed = self
            .inner
            .entries
            .remove_if(key, |_, entry| entry.is_expired_at(now))
            .is_some();
        if removed {
            self.inner.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = ?key, "Cache entry expired");
            self.notify(key, &CacheEvent::Expired);
        }
        removed
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.inner.clock.now();
        self.inner
            .entries
            .iter()
            .filter(|e| !e.value().is_expired_at(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of live entries, in no particular order.
    pub fn keys(&self) -> Vec<K> {
        let now = self.inner.clock.now();
        self.inner
            .entries
            .iter()
            .filter(|e| !e.value().is_expired_at(now))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Register `listener` for changes to `key`.
    ///
    /// The listener stays registered until the returned handle is dropped or
    /// [`ListenerHandle::unsubscribe`] is called.
    pub fn subscribe<F>(&self, key: K, listener: F) -> ListenerHandle
    where
        F: Fn(&K, &CacheEvent<V>) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));

        let inner: Weak<CacheInner<K, V>> = Arc::downgrade(&self.inner);
        ListenerHandle::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove_listener(&key, id);
            }
        })
    }

    /// Number of listeners currently registered for `key`.
    pub fn listener_count(&self, key: &K) -> usize {
        self.inner
            .listeners
            .get(key)
            .map(|registered| registered.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            entry_count: self.inner.entries.len() as u64,
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    fn notify(&self, key: &K, event: &CacheEvent<V>) {
        // Snapshot so no map guard is held while listeners run.
        let listeners: Vec<CacheListener<K, V>> = match self.inner.listeners.get(key) {
            Some(registered) => registered.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(key, event))) {
                tracing::error!(
                    key = ?key,
                    panic = %panic_message(&*panic),
                    "Cache listener panicked"
                );
            }
        }
    }
}

/// Keeps a cache listener registered while alive.
#[must_use = "dropping the handle removes the listener"]
pub struct ListenerHandle {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use babble_core::ManualClock;
    use std::sync::Mutex;

    fn manual_cache<V: Clone + Send + Sync + 'static>(
        default_ttl: Option<Duration>,
    ) -> (KeyedCache<String, V>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (KeyedCache::new(clock.clone(), default_ttl), clock)
    }

    fn recorder() -> (
        Arc<Mutex<Vec<CacheEvent<i32>>>>,
        impl Fn(&String, &CacheEvent<i32>) + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |_: &String, event: &CacheEvent<i32>| {
            sink.lock().unwrap().push(event.clone())
        })
    }

    #[test]
    fn test_get_missing_is_none() {
        let cache: KeyedCache<String, i32> = KeyedCache::default();
        assert_eq!(cache.get(&"nope".to_string()), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_set_overwrites() {
        let cache = KeyedCache::default();
        cache.set("k".to_string(), 1);
        cache.set("k".to_string(), 2);
        assert_eq!(cache.get(&"k".to_string()), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cached_none_differs_from_miss() {
        let cache: KeyedCache<String, Option<i32>> = KeyedCache::default();
        cache.set("user".to_string(), None);
        assert_eq!(cache.get(&"user".to_string()), Some(None));
        assert_eq!(cache.get(&"other".to_string()), None);
    }

    #[test]
    fn test_listeners_observe_sets_in_order() {
        let cache = KeyedCache::default();
        let (seen, listener) = recorder();
        let _handle = cache.subscribe("k".to_string(), listener);

        cache.set("k".to_string(), 1);
        cache.set("k".to_string(), 2);
        cache.set("other".to_string(), 3);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![CacheEvent::Updated(1), CacheEvent::Updated(2)]
        );
    }

    #[test]
    fn test_ttl_expiry_without_invalidate() {
        let (cache, clock) = manual_cache::<i32>(None);
        let (seen, listener) = recorder();
        let _handle = cache.subscribe("k".to_string(), listener);

        cache.set_with_ttl("k".to_string(), 7, Duration::from_secs(5));
        clock.advance(Duration::from_secs(4));
        assert_eq!(cache.get(&"k".to_string()), Some(7));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get(&"k".to_string()), None);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![CacheEvent::Updated(7), CacheEvent::Expired]
        );
    }

    #[test]
    fn test_default_ttl_applies_to_set() {
        let (cache, clock) = manual_cache::<i32>(Some(Duration::from_secs(60)));
        cache.set("k".to_string(), 1);
        let entry = cache.entry(&"k".to_string()).unwrap();
        assert_eq!(entry.expires_at.map(|at| (at - entry.cached_at).num_seconds()), Some(60));

        clock.advance(Duration::from_secs(61));
        assert!(cache.get(&"k".to_string()).is_none());
    }

    #[test]
    fn test_invalidate_notifies_only_when_present() {
        let cache = KeyedCache::default();
        let (seen, listener) = recorder();
        let _handle = cache.subscribe("k".to_string(), listener);

        assert!(!cache.invalidate(&"k".to_string()));
        cache.set("k".to_string(), 1);
        assert!(cache.invalidate(&"k".to_string()));
        assert_eq!(cache.get(&"k".to_string()), None);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![CacheEvent::Updated(1), CacheEvent::Invalidated]
        );
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let cache = KeyedCache::default();
        let _bad = cache.subscribe("k".to_string(), |_: &String, _: &CacheEvent<i32>| {
            panic!("listener blew up")
        });
        let (seen, listener) = recorder();
        let _good = cache.subscribe("k".to_string(), listener);

        cache.set("k".to_string(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![CacheEvent::Updated(1)]);
        assert_eq!(cache.get(&"k".to_string()), Some(1));
    }

    #[test]
    fn test_listener_may_reenter_cache() {
        let cache: KeyedCache<String, i32> = KeyedCache::default();
        let mirror = cache.clone();
        let _handle = cache.subscribe("source".to_string(), move |_, event| {
            if let CacheEvent::Updated(value) = event {
                mirror.set("mirror".to_string(), value * 10);
            }
        });

        cache.set("source".to_string(), 4);
        assert_eq!(cache.get(&"mirror".to_string()), Some(40));
    }

    #[test]
    fn test_dropping_handle_removes_listener() {
        let cache = KeyedCache::default();
        let (seen, listener) = recorder();
        let handle = cache.subscribe("k".to_string(), listener);
        assert_eq!(cache.listener_count(&"k".to_string()), 1);

        drop(handle);
        assert_eq!(cache.listener_count(&"k".to_string()), 0);
        cache.set("k".to_string(), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_keeps_other_listeners() {
        let cache = KeyedCache::default();
        let (first_seen, first) = recorder();
        let (second_seen, second) = recorder();
        let first_handle = cache.subscribe("k".to_string(), first);
        let _second_handle = cache.subscribe("k".to_string(), second);

        first_handle.unsubscribe();
        cache.set("k".to_string(), 1);
        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(*second_seen.lock().unwrap(), vec![CacheEvent::Updated(1)]);
    }

    #[test]
    fn test_gc_purges_only_expired() {
        let (cache, clock) = manual_cache::<i32>(None);
        cache.set_with_ttl("short".to_string(), 1, Duration::from_secs(1));
        cache.set_with_ttl("long".to_string(), 2, Duration::from_secs(100));
        cache.set("forever".to_string(), 3);

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.gc(), 1);
        assert_eq!(cache.stats().entry_count, 2);
        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["forever".to_string(), "long".to_string()]);
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let cache = KeyedCache::default();
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache = KeyedCache::default();
        cache.set("k".to_string(), 1);
        cache.get(&"k".to_string());
        cache.get(&"k".to_string());
        cache.get(&"x".to_string());
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 0.001);
    }
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

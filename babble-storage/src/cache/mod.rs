//! In-memory keyed cache with TTL expiry and change listeners.
//!
//! Reads never block on the network: a miss is `None` and the caller decides
//! where to go next. Writers notify listeners registered for the key so UI
//! state bound to the cache can refresh without polling.
//!
//! # Listener ordering
//!
//! Listeners for one key run synchronously on the thread that performed the
//! write, in registration order, after the write is visible. No internal lock
//! is held while they run, so a listener may read or write the cache. A
//! panicking listener is caught and logged; the others still run.

pub mod keyed;
pub mod stats;

pub use keyed::{CacheEntry, CacheEvent, CacheListener, KeyedCache, ListenerHandle};
pub use stats::CacheStats;

//! Babble Storage - Client-side caches and local persistence
//!
//! - [`cache`]: the in-memory [`KeyedCache`] every other component reads
//!   "last known good" values from
//! - [`local`]: the [`LocalStore`] trait over on-device key-value storage
//! - [`offline`]: [`OfflineMessageCache`], bounded expiring conversation
//!   snapshots for offline reads

pub mod cache;
pub mod local;
pub mod offline;

pub use cache::{CacheEntry, CacheEvent, CacheListener, CacheStats, KeyedCache, ListenerHandle};
pub use local::{FileLocalStore, InMemoryLocalStore, LocalStore};
pub use offline::{CachedConversationSnapshot, OfflineMessageCache};

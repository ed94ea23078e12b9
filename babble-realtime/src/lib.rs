//! Babble Realtime - Live data plumbing
//!
//! The reactive data source abstraction ([`ReactiveDataSource`]), typed
//! query descriptions ([`QueryDescriptor`]) and the [`SubscriptionManager`]
//! that multiplexes many UI subscribers onto one underlying live query per
//! key.

pub mod query;
pub mod source;
pub mod subscription;

pub use query::QueryDescriptor;
pub use source::{InMemoryDataSource, ReactiveDataSource, UnderlyingSubscription};
pub use subscription::{
    SnapshotSink, SubscribeOptions, SubscriptionHandle, SubscriptionManager, SubscriptionPriority,
    SubscriptionStats, SubscriptionUpdate,
};

//! Babble Test Utilities
//!
//! Shared test infrastructure for the Babble workspace:
//! - Flaky collaborators for exercising degraded paths
//! - Test fixtures for common scenarios
//! - Proptest generators for domain types
//! - Custom assertions for Babble error variants

// Re-export in-process collaborators from their source crates
pub use babble_llm::MockTextIntelligence;
pub use babble_realtime::InMemoryDataSource;
pub use babble_storage::{InMemoryLocalStore, LocalStore};

// Re-export core types for convenience
pub use babble_core::{
    BabbleConfig, BabbleError, BabbleResult, ChatId, Clock, ManualClock, Message, MessageId,
    MessageKind, StorageError, SupportedLanguage, Timestamp, TranslationResult, UserId,
};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

// ============================================================================
// FLAKY COLLABORATORS
// ============================================================================

/// [`LocalStore`] that can be told to fail.
///
/// Wraps an [`InMemoryLocalStore`]; failures surface as
/// [`StorageError::Io`] so callers treat them as transient.
#[derive(Debug, Default)]
pub struct FlakyLocalStore {
    inner: InMemoryLocalStore,
    offline: AtomicBool,
    failures_remaining: AtomicU32,
    writes: AtomicU64,
}

impl FlakyLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call while unavailable.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::Relaxed);
    }

    /// Fail the next `count` calls, then recover.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::Relaxed);
    }

    /// Successful `set_item` calls so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check(&self, key: &str) -> BabbleResult<()> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if self.offline.load(Ordering::Relaxed) || injected {
            return Err(StorageError::Io {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for FlakyLocalStore {
    async fn get_item(&self, key: &str) -> BabbleResult<Option<String>> {
        self.check(key)?;
        self.inner.get_item(key).await
    }

    async fn set_item(&self, key: &str, value: String) -> BabbleResult<()> {
        self.check(key)?;
        self.inner.set_item(key, value).await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> BabbleResult<()> {
        self.check(key)?;
        self.inner.remove_item(key).await
    }

    async fn get_all_keys(&self) -> BabbleResult<Vec<String>> {
        self.check("*")?;
        self.inner.get_all_keys().await
    }

    async fn multi_remove(&self, keys: &[String]) -> BabbleResult<()> {
        self.check("*")?;
        self.inner.multi_remove(keys).await
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common testing scenarios.

    use super::*;
    use babble_realtime::ReactiveDataSource;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    /// 2024-01-01T00:00:00Z, the origin for fixture timestamps.
    pub fn epoch() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// `epoch() + secs`.
    pub fn at(secs: u64) -> Timestamp {
        babble_core::clock::expiry_after(epoch(), Duration::from_secs(secs))
    }

    /// A manual clock starting at [`epoch`].
    pub fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(epoch()))
    }

    /// A text message sent `secs` after the epoch.
    pub fn message(id: &str, chat_id: &str, sender_id: &str, text: &str, secs: u64) -> Message {
        Message::text(id, chat_id, sender_id, text, at(secs))
    }

    /// `count` messages `m000`, `m001`, ... one second apart, alternating
    /// between two senders.
    pub fn conversation(chat_id: &str, count: usize) -> Vec<Message> {
        (0..count)
            .map(|i| {
                let sender = if i % 2 == 0 { "alice" } else { "bob" };
                message(
                    &format!("m{i:03}"),
                    chat_id,
                    sender,
                    &format!("message number {i}"),
                    i as u64,
                )
            })
            .collect()
    }

    /// A translation of `message_id` into `target`.
    pub fn translation(message_id: &str, target: SupportedLanguage) -> TranslationResult {
        TranslationResult {
            message_id: message_id.to_string(),
            source_language: Some(SupportedLanguage::English),
            target_language: target,
            translated_text: format!("[{}] {message_id}", target.code()),
            cultural_notes: Vec::new(),
            confidence: 0.9,
            translated_at: epoch(),
        }
    }

    /// An in-memory data source with a profile document per `(user, language
    /// name)` pair.
    pub async fn source_with_profiles(profiles: &[(&str, &str)]) -> Arc<InMemoryDataSource> {
        let source = Arc::new(InMemoryDataSource::new());
        for (user_id, language) in profiles {
            let doc = serde_json::json!({ "displayName": user_id, "preferredLanguage": language });
            // The fixture source is online, so writes cannot fail.
            let _ = source.set(&format!("users/{user_id}"), doc).await;
        }
        source
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Babble domain types.

    use super::*;
    use proptest::prelude::*;

    /// Timestamps within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now)
        })
    }

    pub fn arb_supported_language() -> impl Strategy<Value = SupportedLanguage> {
        prop::sample::select(SupportedLanguage::ALL.to_vec())
    }

    pub fn arb_message_id() -> impl Strategy<Value = MessageId> {
        "m[0-9a-f]{6}"
    }

    pub fn arb_message_kind() -> impl Strategy<Value = MessageKind> {
        prop_oneof![
            8 => Just(MessageKind::Text),
            1 => Just(MessageKind::Image),
            1 => Just(MessageKind::Voice),
        ]
    }

    /// A message in `chat_id` from one of a handful of senders.
    pub fn arb_message(chat_id: ChatId) -> impl Strategy<Value = Message> {
        (
            arb_message_id(),
            "(alice|bob|carol)",
            "[a-zA-Z ]{0,40}",
            arb_message_kind(),
            arb_timestamp(),
        )
            .prop_map(move |(id, sender_id, text, kind, timestamp)| Message {
                id,
                chat_id: chat_id.clone(),
                sender_id,
                text,
                kind,
                timestamp,
                detected_language: None,
            })
    }

    /// Up to `max` messages with distinct ids.
    pub fn arb_messages(chat_id: ChatId, max: usize) -> impl Strategy<Value = Vec<Message>> {
        prop::collection::vec(arb_message(chat_id), 0..=max).prop_map(|mut messages| {
            let mut seen = std::collections::HashSet::new();
            messages.retain(|m| seen.insert(m.id.clone()));
            messages
        })
    }

    /// A configuration that passes `validate()`.
    pub fn arb_valid_config() -> impl Strategy<Value = BabbleConfig> {
        (
            prop::option::of(1u64..86_400_000),
            1usize..200,
            1u64..86_400_000,
            (1usize..20, 20usize..100),
            (1u32..100, 1u64..600_000),
            (1u32..6, 1u64..30_000),
            arb_supported_language(),
        )
            .prop_map(
                |(default_ttl, max_messages, retention, (short, medium), (ops, window), (attempts, timeout), language)| {
                    let mut config = BabbleConfig::default();
                    config.cache.default_ttl_ms = default_ttl;
                    config.offline.max_messages = max_messages;
                    config.offline.retention_ms = retention;
                    config.batch.debounce.short_text_chars = short;
                    config.batch.debounce.medium_text_chars = medium;
                    config.batch.rate_limit_ops = ops;
                    config.batch.rate_limit_window_ms = window;
                    config.language.remote.max_attempts = attempts;
                    config.language.remote.attempt_timeout_ms = timeout;
                    config.language.default_language = language;
                    config
                },
            )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Babble error variants.

    use super::*;

    /// Assert that a result is a rate-limit rejection for `actor_id`.
    #[track_caller]
    pub fn assert_rate_limited<T: std::fmt::Debug>(result: &BabbleResult<T>, actor_id: &str) {
        match result {
            Err(BabbleError::RateLimited(limited)) => {
                assert_eq!(limited.actor_id, actor_id, "Wrong actor in rate limit error");
            }
            other => panic!("Expected RateLimited for {actor_id}, got: {other:?}"),
        }
    }

    /// Assert that a result is a Validation error.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &BabbleResult<T>) {
        match result {
            Err(BabbleError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {other:?}"),
        }
    }

    /// Assert that a result is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &BabbleResult<T>) {
        match result {
            Err(BabbleError::Config(_)) => {}
            other => panic!("Expected Config error, got: {other:?}"),
        }
    }
}

//! Configuration types
//!
//! Every threshold the caching and batching layers use (TTLs, debounce
//! delays, rate-limit windows, retry counts) lives here rather than as a
//! constant in the component that uses it.

use crate::error::{BabbleResult, ConfigError};
use crate::language::SupportedLanguage;
use crate::retry::RetryPolicy;
use crate::Formality;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// TTLs for the in-memory keyed caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// TTL applied by `KeyedCache::set` when no explicit TTL is given.
    /// `None` keeps entries until invalidated.
    pub default_ttl_ms: Option<u64>,
    pub preference_ttl_ms: u64,
    pub detection_ttl_ms: u64,
    pub translation_ttl_ms: u64,
    pub summary_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: None,
            preference_ttl_ms: 30 * 60 * 1000,       // 30 minutes
            detection_ttl_ms: 60 * 60 * 1000,        // 1 hour
            translation_ttl_ms: 24 * 60 * 60 * 1000, // 1 day
            summary_ttl_ms: 10 * 60 * 1000,          // 10 minutes
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }

    pub fn preference_ttl(&self) -> Duration {
        Duration::from_millis(self.preference_ttl_ms)
    }

    pub fn detection_ttl(&self) -> Duration {
        Duration::from_millis(self.detection_ttl_ms)
    }

    pub fn translation_ttl(&self) -> Duration {
        Duration::from_millis(self.translation_ttl_ms)
    }

    pub fn summary_ttl(&self) -> Duration {
        Duration::from_millis(self.summary_ttl_ms)
    }
}

/// Offline conversation snapshot settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OfflineConfig {
    /// Most recent messages kept per conversation.
    pub max_messages: usize,
    /// How long a snapshot may be served after it was saved.
    pub retention_ms: u64,
    /// Prefix for keys written to the local store.
    pub key_prefix: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_messages: 50,
            retention_ms: 7 * 24 * 60 * 60 * 1000, // 7 days
            key_prefix: "offline_chat:".to_string(),
        }
    }
}

impl OfflineConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Language preference and detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LanguageConfig {
    pub default_language: SupportedLanguage,
    /// Retry policy for profile store reads and writes.
    pub remote: RetryPolicy,
    /// Write a device-derived preference back to the profile store.
    pub persist_device_locale: bool,
    /// Texts shorter than this are not sent for detection.
    pub min_detection_chars: usize,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            default_language: SupportedLanguage::English,
            remote: RetryPolicy::default(),
            persist_device_locale: true,
            min_detection_chars: 3,
        }
    }
}

/// Payload-dependent debounce thresholds.
///
/// Short texts wait longer (the user is probably still typing); long texts
/// flush sooner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebounceConfig {
    pub short_text_chars: usize,
    pub medium_text_chars: usize,
    pub short_delay_ms: u64,
    pub medium_delay_ms: u64,
    pub long_delay_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            short_text_chars: 10,
            medium_text_chars: 50,
            short_delay_ms: 2_000,
            medium_delay_ms: 1_000,
            long_delay_ms: 500,
        }
    }
}

/// Batch queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub debounce: DebounceConfig,
    /// Operations allowed per actor within `rate_limit_window_ms`.
    pub rate_limit_ops: u32,
    pub rate_limit_window_ms: u64,
    /// Upper bound on one item's handler call.
    pub item_timeout_ms: u64,
    /// Collapse items with the same dedupe key inside one batch.
    pub coalesce: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            debounce: DebounceConfig::default(),
            rate_limit_ops: 10,
            rate_limit_window_ms: 60_000,
            item_timeout_ms: 10_000,
            coalesce: true,
        }
    }
}

impl BatchConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }
}

/// Defaults applied to live subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubscriptionConfig {
    pub cache_by_default: bool,
    pub shared_by_default: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            cache_by_default: true,
            shared_by_default: true,
        }
    }
}

/// Text intelligence call settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntelligenceConfig {
    pub call_timeout_ms: u64,
    /// Register requested for message translations.
    pub formality: Formality,
    /// Ask the provider for cultural notes alongside translations.
    pub cultural_context: bool,
}

impl Default for IntelligenceConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 15_000,
            formality: Formality::Neutral,
            cultural_context: true,
        }
    }
}

impl IntelligenceConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BabbleConfig {
    pub cache: CacheConfig,
    pub offline: OfflineConfig,
    pub language: LanguageConfig,
    pub batch: BatchConfig,
    pub subscriptions: SubscriptionConfig,
    pub intelligence: IntelligenceConfig,
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl BabbleConfig {
    /// Validate the configuration.
    ///
    /// Validates:
    /// - offline.max_messages > 0 and retention is positive
    /// - every TTL, delay and timeout is positive
    /// - retry attempts >= 1 and backoff_multiplier >= 1.0
    /// - rate limit ops > 0 and window positive
    /// - debounce thresholds are ordered (short < medium)
    pub fn validate(&self) -> BabbleResult<()> {
        if self.offline.max_messages == 0 {
            return Err(invalid("offline.max_messages", 0, "max_messages must be greater than 0").into());
        }
        if self.offline.retention_ms == 0 {
            return Err(invalid("offline.retention_ms", 0, "retention must be positive").into());
        }
        if self.offline.key_prefix.trim().is_empty() {
            return Err(invalid("offline.key_prefix", "", "key_prefix must not be empty").into());
        }

        if self.cache.default_ttl_ms == Some(0) {
            return Err(invalid("cache.default_ttl_ms", 0, "default TTL must be positive when set").into());
        }
        for (field, value) in [
            ("cache.preference_ttl_ms", self.cache.preference_ttl_ms),
            ("cache.detection_ttl_ms", self.cache.detection_ttl_ms),
            ("cache.translation_ttl_ms", self.cache.translation_ttl_ms),
            ("cache.summary_ttl_ms", self.cache.summary_ttl_ms),
            ("batch.rate_limit_window_ms", self.batch.rate_limit_window_ms),
            ("batch.item_timeout_ms", self.batch.item_timeout_ms),
            ("batch.debounce.short_delay_ms", self.batch.debounce.short_delay_ms),
            ("batch.debounce.medium_delay_ms", self.batch.debounce.medium_delay_ms),
            ("batch.debounce.long_delay_ms", self.batch.debounce.long_delay_ms),
            ("language.remote.attempt_timeout_ms", self.language.remote.attempt_timeout_ms),
            ("intelligence.call_timeout_ms", self.intelligence.call_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, 0, "must be positive").into());
            }
        }

        if self.batch.rate_limit_ops == 0 {
            return Err(invalid("batch.rate_limit_ops", 0, "rate_limit_ops must be greater than 0").into());
        }
        if self.batch.debounce.short_text_chars >= self.batch.debounce.medium_text_chars {
            return Err(invalid(
                "batch.debounce.short_text_chars",
                self.batch.debounce.short_text_chars,
                "short_text_chars must be below medium_text_chars",
            )
            .into());
        }

        if self.language.remote.max_attempts == 0 {
            return Err(invalid("language.remote.max_attempts", 0, "max_attempts must be at least 1").into());
        }
        if self.language.remote.backoff_multiplier < 1.0 {
            return Err(invalid(
                "language.remote.backoff_multiplier",
                self.language.remote.backoff_multiplier,
                "backoff_multiplier must be at least 1.0",
            )
            .into());
        }

        Ok(())
    }

    /// Apply `BABBLE_*` environment overrides on top of this configuration.
    ///
    /// Environment variables:
    /// - `BABBLE_CACHE_DEFAULT_TTL_MS`
    /// - `BABBLE_OFFLINE_MAX_MESSAGES`, `BABBLE_OFFLINE_RETENTION_MS`
    /// - `BABBLE_DEFAULT_LANGUAGE` (name or code)
    /// - `BABBLE_REMOTE_MAX_ATTEMPTS`, `BABBLE_REMOTE_TIMEOUT_MS`
    /// - `BABBLE_RATE_LIMIT_OPS`, `BABBLE_RATE_LIMIT_WINDOW_MS`
    /// - `BABBLE_BATCH_ITEM_TIMEOUT_MS`
    /// - `BABBLE_INTELLIGENCE_TIMEOUT_MS`
    ///
    /// Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ttl) = env_parse("BABBLE_CACHE_DEFAULT_TTL_MS") {
            self.cache.default_ttl_ms = Some(ttl);
        }
        if let Some(max) = env_parse("BABBLE_OFFLINE_MAX_MESSAGES") {
            self.offline.max_messages = max;
        }
        if let Some(retention) = env_parse("BABBLE_OFFLINE_RETENTION_MS") {
            self.offline.retention_ms = retention;
        }
        if let Some(language) = env_parse::<SupportedLanguage>("BABBLE_DEFAULT_LANGUAGE") {
            self.language.default_language = language;
        }
        if let Some(attempts) = env_parse("BABBLE_REMOTE_MAX_ATTEMPTS") {
            self.language.remote.max_attempts = attempts;
        }
        if let Some(timeout) = env_parse("BABBLE_REMOTE_TIMEOUT_MS") {
            self.language.remote.attempt_timeout_ms = timeout;
        }
        if let Some(ops) = env_parse("BABBLE_RATE_LIMIT_OPS") {
            self.batch.rate_limit_ops = ops;
        }
        if let Some(window) = env_parse("BABBLE_RATE_LIMIT_WINDOW_MS") {
            self.batch.rate_limit_window_ms = window;
        }
        if let Some(timeout) = env_parse("BABBLE_BATCH_ITEM_TIMEOUT_MS") {
            self.batch.item_timeout_ms = timeout;
        }
        if let Some(timeout) = env_parse("BABBLE_INTELLIGENCE_TIMEOUT_MS") {
            self.intelligence.call_timeout_ms = timeout;
        }
        self
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }
}

// =============================================================================
// TESTS
// =============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::BabbleError;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any backoff multiplier below 1.0 is rejected.
        #[test]
        fn prop_config_rejects_shrinking_backoff(multiplier in 0.0f32..0.999f32) {
            let mut config = BabbleConfig::default();
            config.language.remote.backoff_multiplier = multiplier;
            let result = config.validate();
            if let Err(BabbleError::Config(ConfigError::InvalidValue { field, .. })) = result {
                prop_assert_eq!(field, "language.remote.backoff_multiplier");
            } else {
                prop_assert!(false, "Expected ConfigError::InvalidValue");
            }
        }

        /// Any positive message bound with positive retention is accepted.
        #[test]
        fn prop_config_accepts_positive_offline_bounds(max in 1usize..10_000, retention in 1u64..u64::MAX / 2) {
            let mut config = BabbleConfig::default();
            config.offline.max_messages = max;
            config.offline.retention_ms = retention;
            prop_assert!(config.validate().is_ok());
        }
    }
}

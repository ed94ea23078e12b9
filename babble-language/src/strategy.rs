//! Ordered preference strategies and the chain that composes them.

use std::sync::Arc;

use async_trait::async_trait;
use babble_core::{
    retry_with_backoff, BabbleError, LanguagePreference, PreferenceSource, RetryPolicy,
    SupportedLanguage,
};

use crate::preference::{PreferenceCache, ResolveOptions};
use crate::profile::{LocaleProvider, ProfileStore};

/// Result of one strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    /// A supported language was found; the chain stops here.
    Resolved(SupportedLanguage),
    /// Nothing to offer (miss, unsupported value, not applicable).
    Skipped,
    /// The strategy's collaborator failed; the chain moves on.
    Failed(BabbleError),
}

/// One step of the preference fallback chain.
#[async_trait]
pub trait PreferenceStrategy: Send + Sync {
    /// Reported as the preference source when this strategy resolves.
    fn source(&self) -> PreferenceSource;

    async fn attempt(&self, user_id: &str, options: &ResolveOptions) -> StrategyOutcome;
}

/// Tries strategies in order and falls back to a default language.
///
/// Resolution never fails: strategy failures are logged and skipped.
pub struct FallbackChain {
    strategies: Vec<Arc<dyn PreferenceStrategy>>,
    default_language: SupportedLanguage,
}

impl FallbackChain {
    pub fn new(default_language: SupportedLanguage) -> Self {
        Self {
            strategies: Vec::new(),
            default_language,
        }
    }

    /// Append a strategy, tried after every strategy already added.
    pub fn then(mut self, strategy: Arc<dyn PreferenceStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn sources(&self) -> Vec<PreferenceSource> {
        self.strategies.iter().map(|s| s.source()).collect()
    }

    pub fn default_language(&self) -> SupportedLanguage {
        self.default_language
    }

    pub async fn resolve(&self, user_id: &str, options: &ResolveOptions) -> LanguagePreference {
        for strategy in &self.strategies {
            let source = strategy.source();
            match strategy.attempt(user_id, options).await {
                StrategyOutcome::Resolved(language) => {
                    tracing::debug!(user_id, source = %source, language = %language, "Language preference resolved");
                    return LanguagePreference {
                        user_id: user_id.to_string(),
                        language,
                        source,
                    };
                }
                StrategyOutcome::Skipped => {
                    tracing::trace!(user_id, source = %source, "Preference strategy skipped");
                }
                StrategyOutcome::Failed(e) => {
                    tracing::warn!(user_id, source = %source, error = %e, "Preference strategy failed");
                }
            }
        }
        LanguagePreference {
            user_id: user_id.to_string(),
            language: self.default_language,
            source: PreferenceSource::Default,
        }
    }
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("sources", &self.sources())
            .field("default_language", &self.default_language)
            .finish()
    }
}

// ============================================================================
// STRATEGIES
// ============================================================================

/// In-memory cache, then the optional local store.
pub struct CacheStrategy {
    cache: PreferenceCache,
}

impl CacheStrategy {
    pub fn new(cache: PreferenceCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl PreferenceStrategy for CacheStrategy {
    fn source(&self) -> PreferenceSource {
        PreferenceSource::Cache
    }

    async fn attempt(&self, user_id: &str, options: &ResolveOptions) -> StrategyOutcome {
        if options.force_refresh {
            return StrategyOutcome::Skipped;
        }
        match self.cache.load(user_id).await {
            Ok(Some(language)) => StrategyOutcome::Resolved(language),
            Ok(None) => StrategyOutcome::Skipped,
            Err(e) => StrategyOutcome::Failed(e),
        }
    }
}

/// The user's profile in the remote store, read with bounded retries.
/// A hit is written through to the cache.
pub struct RemoteStrategy {
    profiles: Arc<dyn ProfileStore>,
    policy: RetryPolicy,
    cache: PreferenceCache,
}

impl RemoteStrategy {
    pub fn new(profiles: Arc<dyn ProfileStore>, policy: RetryPolicy, cache: PreferenceCache) -> Self {
        Self {
            profiles,
            policy,
            cache,
        }
    }
}

#[async_trait]
impl PreferenceStrategy for RemoteStrategy {
    fn source(&self) -> PreferenceSource {
        PreferenceSource::Remote
    }

    async fn attempt(&self, user_id: &str, _options: &ResolveOptions) -> StrategyOutcome {
        let profiles = &self.profiles;
        let stored = retry_with_backoff(&self.policy, "profile read", |_| profiles.read_language(user_id)).await;
        match stored {
            Ok(Some(raw)) => match SupportedLanguage::parse_lenient(&raw) {
                Some(language) => {
                    self.cache.store(user_id, language).await;
                    StrategyOutcome::Resolved(language)
                }
                None => {
                    tracing::warn!(user_id, stored = %raw, "Stored preference is not a supported language");
                    StrategyOutcome::Skipped
                }
            },
            Ok(None) => StrategyOutcome::Skipped,
            Err(e) => StrategyOutcome::Failed(e),
        }
    }
}

/// The device locale. When `persist` is set the language is written back to
/// the profile and cached only if that write succeeds.
pub struct DeviceStrategy {
    locale: Arc<dyn LocaleProvider>,
    profiles: Arc<dyn ProfileStore>,
    policy: RetryPolicy,
    cache: PreferenceCache,
    persist: bool,
}

impl DeviceStrategy {
    pub fn new(
        locale: Arc<dyn LocaleProvider>,
        profiles: Arc<dyn ProfileStore>,
        policy: RetryPolicy,
        cache: PreferenceCache,
        persist: bool,
    ) -> Self {
        Self {
            locale,
            profiles,
            policy,
            cache,
            persist,
        }
    }
}

#[async_trait]
impl PreferenceStrategy for DeviceStrategy {
    fn source(&self) -> PreferenceSource {
        PreferenceSource::Device
    }

    async fn attempt(&self, user_id: &str, _options: &ResolveOptions) -> StrategyOutcome {
        let Some(language) = self
            .locale
            .device_locale()
            .and_then(|locale| SupportedLanguage::from_code(&locale))
        else {
            return StrategyOutcome::Skipped;
        };

        if self.persist {
            let profiles = &self.profiles;
            let written = retry_with_backoff(&self.policy, "profile write", |_| {
                profiles.write_language(user_id, language)
            })
            .await;
            match written {
                Ok(()) => self.cache.store(user_id, language).await,
                Err(e) => {
                    tracing::warn!(user_id, language = %language, error = %e, "Could not persist device language");
                }
            }
        }
        StrategyOutcome::Resolved(language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use babble_core::RemoteError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        source: PreferenceSource,
        outcome: StrategyOutcome,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(source: PreferenceSource, outcome: StrategyOutcome) -> Arc<Self> {
            Arc::new(Self {
                source,
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PreferenceStrategy for Fixed {
        fn source(&self) -> PreferenceSource {
            self.source
        }

        async fn attempt(&self, _user_id: &str, _options: &ResolveOptions) -> StrategyOutcome {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.outcome.clone()
        }
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_resolution() {
        let failing = Fixed::new(
            PreferenceSource::Cache,
            StrategyOutcome::Failed(RemoteError::unavailable("get", "offline").into()),
        );
        let resolving = Fixed::new(
            PreferenceSource::Remote,
            StrategyOutcome::Resolved(SupportedLanguage::German),
        );
        let never = Fixed::new(
            PreferenceSource::Device,
            StrategyOutcome::Resolved(SupportedLanguage::Korean),
        );
        let chain = FallbackChain::new(SupportedLanguage::English)
            .then(failing.clone())
            .then(resolving.clone())
            .then(never.clone());

        let preference = chain.resolve("u1", &ResolveOptions::default()).await;
        assert_eq!(preference.language, SupportedLanguage::German);
        assert_eq!(preference.source, PreferenceSource::Remote);
        assert_eq!(failing.calls.load(Ordering::Relaxed), 1);
        assert_eq!(never.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_exhausted_chain_returns_default() {
        let chain = FallbackChain::new(SupportedLanguage::Spanish)
            .then(Fixed::new(PreferenceSource::Cache, StrategyOutcome::Skipped));
        let preference = chain.resolve("u1", &ResolveOptions::default()).await;
        assert_eq!(preference.language, SupportedLanguage::Spanish);
        assert_eq!(preference.source, PreferenceSource::Default);
        assert_eq!(chain.sources(), vec![PreferenceSource::Cache]);
    }
}

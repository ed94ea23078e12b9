//! Language preference resolution.
//!
//! `resolve` walks cache, remote profile, device locale and finally the
//! configured default, and never fails. `update` validates first, writes the
//! remote profile with bounded retries and only then touches the cache.

use std::sync::Arc;
use std::time::Duration;

use babble_core::{
    retry_with_backoff, BabbleResult, LanguageConfig, LanguagePreference, RetryPolicy,
    SupportedLanguage, UserId, ValidationError,
};
use babble_storage::{KeyedCache, LocalStore};

use crate::profile::{LocaleProvider, ProfileStore};
use crate::strategy::{CacheStrategy, DeviceStrategy, FallbackChain, RemoteStrategy};

/// Options for [`LanguagePreferenceResolver::resolve`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Ignore cached preferences and re-read the remote profile.
    pub force_refresh: bool,
}

impl ResolveOptions {
    pub fn refresh() -> Self {
        Self { force_refresh: true }
    }
}

fn local_key(user_id: &str) -> String {
    format!("language_pref:{user_id}")
}

/// Cached preferences: an in-memory [`KeyedCache`] with a TTL, optionally
/// backed by a [`LocalStore`] so they survive restarts.
///
/// Local store failures are logged and otherwise ignored.
#[derive(Clone)]
pub struct PreferenceCache {
    memory: KeyedCache<UserId, SupportedLanguage>,
    ttl: Duration,
    local: Option<Arc<dyn LocalStore>>,
}

impl std::fmt::Debug for PreferenceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreferenceCache")
            .field("entries", &self.memory.len())
            .field("ttl", &self.ttl)
            .field("persistent", &self.local.is_some())
            .finish()
    }
}

impl PreferenceCache {
    pub fn new(memory: KeyedCache<UserId, SupportedLanguage>, ttl: Duration) -> Self {
        Self {
            memory,
            ttl,
            local: None,
        }
    }

    pub fn with_local_store(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn memory(&self) -> &KeyedCache<UserId, SupportedLanguage> {
        &self.memory
    }

    /// In-memory value only.
    pub fn peek(&self, user_id: &str) -> Option<SupportedLanguage> {
        self.memory.get(&user_id.to_string())
    }

    /// In-memory value, then the local store. A local hit is promoted back
    /// into memory.
    pub async fn load(&self, user_id: &str) -> BabbleResult<Option<SupportedLanguage>> {
        if let Some(language) = self.peek(user_id) {
            return Ok(Some(language));
        }
        let Some(local) = &self.local else {
            return Ok(None);
        };
        let stored = local.get_item(&local_key(user_id)).await?;
        let language = stored.as_deref().and_then(SupportedLanguage::parse_lenient);
        if let Some(language) = language {
            self.memory.set_with_ttl(user_id.to_string(), language, self.ttl);
        }
        Ok(language)
    }

    pub async fn store(&self, user_id: &str, language: SupportedLanguage) {
        self.memory.set_with_ttl(user_id.to_string(), language, self.ttl);
        if let Some(local) = &self.local {
            if let Err(e) = local
                .set_item(&local_key(user_id), language.name().to_string())
                .await
            {
                tracing::warn!(user_id, error = %e, "Failed to persist language preference locally");
            }
        }
    }

    pub async fn forget(&self, user_id: &str) {
        self.memory.invalidate(&user_id.to_string());
        if let Some(local) = &self.local {
            if let Err(e) = local.remove_item(&local_key(user_id)).await {
                tracing::warn!(user_id, error = %e, "Failed to remove local language preference");
            }
        }
    }
}

/// Resolves and updates users' preferred display language.
pub struct LanguagePreferenceResolver {
    chain: FallbackChain,
    cache: PreferenceCache,
    profiles: Arc<dyn ProfileStore>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for LanguagePreferenceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguagePreferenceResolver")
            .field("chain", &self.chain)
            .field("cache", &self.cache)
            .finish()
    }
}

impl LanguagePreferenceResolver {
    /// The standard chain: cache, remote profile, device locale, default.
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        locale: Arc<dyn LocaleProvider>,
        cache: PreferenceCache,
        config: &LanguageConfig,
    ) -> Self {
        let chain = FallbackChain::new(config.default_language)
            .then(Arc::new(CacheStrategy::new(cache.clone())))
            .then(Arc::new(RemoteStrategy::new(
                Arc::clone(&profiles),
                config.remote.clone(),
                cache.clone(),
            )))
            .then(Arc::new(DeviceStrategy::new(
                locale,
                Arc::clone(&profiles),
                config.remote.clone(),
                cache.clone(),
                config.persist_device_locale,
            )));
        Self::with_chain(chain, cache, profiles, config.remote.clone())
    }

    /// A resolver with a custom chain. `cache`, `profiles` and `policy` are
    /// used by [`update`](Self::update) and forced refreshes.
    pub fn with_chain(
        chain: FallbackChain,
        cache: PreferenceCache,
        profiles: Arc<dyn ProfileStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            chain,
            cache,
            profiles,
            policy,
        }
    }

    pub fn cache(&self) -> &PreferenceCache {
        &self.cache
    }

    /// Currently cached language, without any I/O.
    pub fn cached(&self, user_id: &str) -> Option<SupportedLanguage> {
        self.cache.peek(user_id)
    }

    pub async fn resolve(&self, user_id: &str, options: ResolveOptions) -> LanguagePreference {
        if options.force_refresh {
            self.cache.forget(user_id).await;
        }
        self.chain.resolve(user_id, &options).await
    }

    /// Set a user's preference.
    ///
    /// Unsupported languages are rejected before any write. The cache is
    /// updated only after the remote write succeeds.
    pub async fn update(&self, user_id: &str, language: &str) -> BabbleResult<SupportedLanguage> {
        let Some(language) = SupportedLanguage::parse_lenient(language) else {
            return Err(ValidationError::UnsupportedLanguage {
                language: language.to_string(),
            }
            .into());
        };

        let profiles = &self.profiles;
        retry_with_backoff(&self.policy, "profile write", |_| {
            profiles.write_language(user_id, language)
        })
        .await?;

        self.cache.store(user_id, language).await;
        tracing::info!(user_id, language = %language, "Language preference updated");
        Ok(language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{DataSourceProfileStore, StaticLocaleProvider};
    use async_trait::async_trait;
    use babble_core::{BabbleError, PreferenceSource};
    use babble_realtime::{InMemoryDataSource, ReactiveDataSource};
    use babble_test_utils::{fixtures, FlakyLocalStore, InMemoryLocalStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls through to a data-source profile store.
    struct CountingProfiles {
        inner: DataSourceProfileStore,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl CountingProfiles {
        fn new(source: Arc<InMemoryDataSource>) -> Arc<Self> {
            Arc::new(Self {
                inner: DataSourceProfileStore::new(source),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            })
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::Relaxed)
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl ProfileStore for CountingProfiles {
        async fn read_language(&self, user_id: &str) -> BabbleResult<Option<String>> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.inner.read_language(user_id).await
        }

        async fn write_language(&self, user_id: &str, language: SupportedLanguage) -> BabbleResult<()> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.inner.write_language(user_id, language).await
        }
    }

    fn memory_cache() -> PreferenceCache {
        PreferenceCache::new(KeyedCache::default(), Duration::from_secs(1_800))
    }

    fn resolver(
        profiles: Arc<CountingProfiles>,
        locale: StaticLocaleProvider,
        cache: PreferenceCache,
    ) -> LanguagePreferenceResolver {
        LanguagePreferenceResolver::new(profiles, Arc::new(locale), cache, &LanguageConfig::default())
    }

    async fn stored_language(source: &InMemoryDataSource, user_id: &str) -> Option<String> {
        source
            .get(&format!("users/{user_id}"))
            .await
            .unwrap()
            .and_then(|doc| doc["preferredLanguage"].as_str().map(str::to_string))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_remote_and_empty_cache_yield_default() {
        let source = Arc::new(InMemoryDataSource::new());
        source.set_available(false);
        let profiles = CountingProfiles::new(source);
        let resolver = resolver(profiles.clone(), StaticLocaleProvider::unknown(), memory_cache());

        let preference = resolver.resolve("u1", ResolveOptions::default()).await;
        assert_eq!(preference.language, SupportedLanguage::English);
        assert_eq!(preference.source, PreferenceSource::Default);
        // Bounded retries.
        assert_eq!(profiles.reads(), 3);
    }

    #[tokio::test]
    async fn test_remote_hit_is_cached() {
        let source = fixtures::source_with_profiles(&[("u1", "Spanish")]).await;
        let profiles = CountingProfiles::new(source);
        let resolver = resolver(profiles.clone(), StaticLocaleProvider::unknown(), memory_cache());

        let first = resolver.resolve("u1", ResolveOptions::default()).await;
        assert_eq!(first.language, SupportedLanguage::Spanish);
        assert_eq!(first.source, PreferenceSource::Remote);

        let second = resolver.resolve("u1", ResolveOptions::default()).await;
        assert_eq!(second.source, PreferenceSource::Cache);
        assert_eq!(profiles.reads(), 1);
        assert_eq!(resolver.cached("u1"), Some(SupportedLanguage::Spanish));
    }

    #[tokio::test]
    async fn test_device_locale_is_persisted_and_cached() {
        let source = Arc::new(InMemoryDataSource::new());
        let profiles = CountingProfiles::new(source.clone());
        let resolver = resolver(profiles.clone(), StaticLocaleProvider::new("es-MX"), memory_cache());

        let preference = resolver.resolve("u1", ResolveOptions::default()).await;
        assert_eq!(preference.language, SupportedLanguage::Spanish);
        assert_eq!(preference.source, PreferenceSource::Device);
        assert_eq!(stored_language(&source, "u1").await.as_deref(), Some("Spanish"));
        assert_eq!(resolver.cached("u1"), Some(SupportedLanguage::Spanish));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_language_not_cached_when_persist_fails() {
        let source = Arc::new(InMemoryDataSource::new());
        source.set_available(false);
        let profiles = CountingProfiles::new(source);
        let resolver = resolver(profiles.clone(), StaticLocaleProvider::new("fr-CA"), memory_cache());

        let first = resolver.resolve("u1", ResolveOptions::default()).await;
        assert_eq!(first.language, SupportedLanguage::French);
        assert_eq!(first.source, PreferenceSource::Device);
        assert_eq!(resolver.cached("u1"), None);
        assert_eq!(profiles.writes(), 3);

        let second = resolver.resolve("u1", ResolveOptions::default()).await;
        assert_eq!(second.source, PreferenceSource::Device);
    }

    #[tokio::test]
    async fn test_unsupported_remote_value_falls_through() {
        let source = fixtures::source_with_profiles(&[("u1", "Klingon")]).await;
        let profiles = CountingProfiles::new(source);
        let resolver = resolver(profiles, StaticLocaleProvider::unknown(), memory_cache());

        let preference = resolver.resolve("u1", ResolveOptions::default()).await;
        assert_eq!(preference.language, SupportedLanguage::English);
        assert_eq!(preference.source, PreferenceSource::Default);
    }

    #[tokio::test]
    async fn test_force_refresh_skips_cache() {
        let source = fixtures::source_with_profiles(&[("u1", "German")]).await;
        let profiles = CountingProfiles::new(source);
        let cache = memory_cache();
        cache.store("u1", SupportedLanguage::French).await;
        let resolver = resolver(profiles.clone(), StaticLocaleProvider::unknown(), cache);

        let cached = resolver.resolve("u1", ResolveOptions::default()).await;
        assert_eq!(cached.language, SupportedLanguage::French);
        assert_eq!(profiles.reads(), 0);

        let fresh = resolver.resolve("u1", ResolveOptions::refresh()).await;
        assert_eq!(fresh.language, SupportedLanguage::German);
        assert_eq!(fresh.source, PreferenceSource::Remote);
        assert_eq!(resolver.cached("u1"), Some(SupportedLanguage::German));
    }

    #[tokio::test]
    async fn test_update_rejects_unsupported_language() {
        let source = fixtures::source_with_profiles(&[("u1", "Spanish")]).await;
        let profiles = CountingProfiles::new(source.clone());
        let cache = memory_cache();
        cache.store("u1", SupportedLanguage::Spanish).await;
        let resolver = resolver(profiles.clone(), StaticLocaleProvider::unknown(), cache);

        let result = resolver.update("u1", "Klingon").await;
        babble_test_utils::assertions::assert_validation_error(&result);
        assert_eq!(profiles.writes(), 0);
        assert_eq!(resolver.cached("u1"), Some(SupportedLanguage::Spanish));
        assert_eq!(stored_language(&source, "u1").await.as_deref(), Some("Spanish"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_failure_leaves_cache_unchanged() {
        let source = Arc::new(InMemoryDataSource::new());
        source.set_available(false);
        let profiles = CountingProfiles::new(source);
        let cache = memory_cache();
        cache.store("u1", SupportedLanguage::Italian).await;
        let resolver = resolver(profiles, StaticLocaleProvider::unknown(), cache);

        let err = resolver.update("u1", "Japanese").await.unwrap_err();
        assert!(matches!(err, BabbleError::Remote(_)));
        assert_eq!(resolver.cached("u1"), Some(SupportedLanguage::Italian));
    }

    #[tokio::test]
    async fn test_update_writes_remote_then_cache() {
        let source = Arc::new(InMemoryDataSource::new());
        let profiles = CountingProfiles::new(source.clone());
        let resolver = resolver(profiles, StaticLocaleProvider::unknown(), memory_cache());

        let language = resolver.update("u1", "ja").await.unwrap();
        assert_eq!(language, SupportedLanguage::Japanese);
        assert_eq!(stored_language(&source, "u1").await.as_deref(), Some("Japanese"));
        assert_eq!(resolver.cached("u1"), Some(SupportedLanguage::Japanese));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_store_survives_restart() {
        let local: Arc<dyn LocalStore> = Arc::new(InMemoryLocalStore::new());
        let source = fixtures::source_with_profiles(&[("u1", "Korean")]).await;

        let first = resolver(
            CountingProfiles::new(source.clone()),
            StaticLocaleProvider::unknown(),
            memory_cache().with_local_store(local.clone()),
        );
        assert_eq!(
            first.resolve("u1", ResolveOptions::default()).await.source,
            PreferenceSource::Remote
        );

        // Fresh memory, remote unreachable.
        source.set_available(false);
        let second = resolver(
            CountingProfiles::new(source),
            StaticLocaleProvider::unknown(),
            memory_cache().with_local_store(local),
        );
        let preference = second.resolve("u1", ResolveOptions::default()).await;
        assert_eq!(preference.language, SupportedLanguage::Korean);
        assert_eq!(preference.source, PreferenceSource::Cache);
        assert_eq!(second.cached("u1"), Some(SupportedLanguage::Korean));
    }

    #[tokio::test]
    async fn test_local_store_failure_is_not_fatal() {
        let local = Arc::new(FlakyLocalStore::new());
        local.set_available(false);
        let source = fixtures::source_with_profiles(&[("u1", "Hindi")]).await;
        let resolver = resolver(
            CountingProfiles::new(source),
            StaticLocaleProvider::unknown(),
            memory_cache().with_local_store(local),
        );

        let preference = resolver.resolve("u1", ResolveOptions::default()).await;
        assert_eq!(preference.language, SupportedLanguage::Hindi);
        assert_eq!(preference.source, PreferenceSource::Remote);
        assert_eq!(resolver.cached("u1"), Some(SupportedLanguage::Hindi));
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_resolved_language_is_always_supported(stored in "[A-Za-z-]{0,12}") {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .start_paused(true)
                    .build()
                    .unwrap();
                let preference = runtime.block_on(async {
                    let source = fixtures::source_with_profiles(&[("u1", stored.as_str())]).await;
                    let resolver = resolver(
                        CountingProfiles::new(source),
                        StaticLocaleProvider::unknown(),
                        memory_cache(),
                    );
                    resolver.resolve("u1", ResolveOptions::default()).await
                });
                prop_assert!(SupportedLanguage::ALL.contains(&preference.language));
                match SupportedLanguage::parse_lenient(&stored) {
                    Some(language) => {
                        prop_assert_eq!(preference.language, language);
                        prop_assert_eq!(preference.source, PreferenceSource::Remote);
                    }
                    None => prop_assert_eq!(preference.source, PreferenceSource::Default),
                }
            }
        }
    }
}

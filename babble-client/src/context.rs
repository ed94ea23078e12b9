//! The process-scoped messaging context.
//!
//! [`MessagingCore`] owns every cache, the subscription manager and the
//! background queues. The embedding app creates one with
//! [`MessagingCore::init`] at startup and calls
//! [`shutdown`](MessagingCore::shutdown) before exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use babble_batch::{BatchReport, DebouncedBatchProcessor, InsightRequest, InsightsProcessor};
use babble_core::clock::{Clock, SystemClock};
use babble_core::{
    preceding_texts, BabbleConfig, BabbleError, BabbleResult, ChatId, ConversationInsights,
    LanguagePreference, Message, SupportedLanguage,
};
use babble_language::{
    DataSourceProfileStore, LanguageDetector, LanguagePreferenceResolver, LocaleProvider,
    PreferenceCache, ResolveOptions, StaticLocaleProvider, TranslationOutcome, TranslationService,
    CONTEXT_MESSAGES,
};
use babble_llm::{TextIntelligence, TimeoutIntelligence};
use babble_realtime::{
    QueryDescriptor, ReactiveDataSource, SubscribeOptions, SubscriptionHandle, SubscriptionManager,
    SubscriptionUpdate,
};
use babble_storage::{CachedConversationSnapshot, KeyedCache, LocalStore, OfflineMessageCache};
use serde_json::Value as JsonValue;

/// External collaborators supplied by the embedding app.
#[derive(Clone)]
pub struct CoreDependencies {
    pub data_source: Arc<dyn ReactiveDataSource>,
    pub intelligence: Arc<dyn TextIntelligence>,
    pub local_store: Arc<dyn LocalStore>,
    pub locale: Arc<dyn LocaleProvider>,
    pub clock: Arc<dyn Clock>,
}

impl CoreDependencies {
    /// Wall-clock time and no known device locale.
    pub fn new(
        data_source: Arc<dyn ReactiveDataSource>,
        intelligence: Arc<dyn TextIntelligence>,
        local_store: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            data_source,
            intelligence,
            local_store,
            locale: Arc::new(StaticLocaleProvider::unknown()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_locale(mut self, locale: Arc<dyn LocaleProvider>) -> Self {
        self.locale = locale;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// What [`MessagingCore::shutdown`] flushed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub insights: Option<BatchReport>,
    pub detections: Option<BatchReport>,
    pub subscriptions_closed: usize,
}

pub struct MessagingCore {
    config: BabbleConfig,
    data_source: Arc<dyn ReactiveDataSource>,
    subscriptions: SubscriptionManager<JsonValue>,
    preferences: LanguagePreferenceResolver,
    detector: LanguageDetector,
    translations: TranslationService,
    offline: OfflineMessageCache,
    insights: KeyedCache<ChatId, ConversationInsights>,
    insights_queue: DebouncedBatchProcessor<InsightRequest>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MessagingCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingCore")
            .field("subscriptions", &self.subscriptions)
            .field("translations", &self.translations)
            .field("insights_queue", &self.insights_queue)
            .field("closed", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl MessagingCore {
    /// Validate `config` and wire every component.
    ///
    /// Every text intelligence call is bounded by
    /// `intelligence.call_timeout_ms`.
    pub fn init(config: BabbleConfig, deps: CoreDependencies) -> BabbleResult<Self> {
        config.validate()?;
        let clock = deps.clock;

        let intelligence: Arc<dyn TextIntelligence> = Arc::new(TimeoutIntelligence::from_config(
            deps.intelligence,
            &config.intelligence,
        ));

        let subscriptions =
            SubscriptionManager::new(KeyedCache::from_config(&config.cache, Arc::clone(&clock)));

        let preference_cache = PreferenceCache::new(
            KeyedCache::new(Arc::clone(&clock), None),
            config.cache.preference_ttl(),
        )
        .with_local_store(Arc::clone(&deps.local_store));
        let preferences = LanguagePreferenceResolver::new(
            Arc::new(DataSourceProfileStore::new(Arc::clone(&deps.data_source))),
            deps.locale,
            preference_cache,
            &config.language,
        );

        let detector = LanguageDetector::new(
            Arc::clone(&intelligence),
            KeyedCache::new(Arc::clone(&clock), None),
            Arc::clone(&clock),
            &config,
        );
        let translations = TranslationService::new(Arc::clone(&intelligence), Arc::clone(&clock), &config);
        let offline = OfflineMessageCache::new(deps.local_store, Arc::clone(&clock), config.offline.clone());

        let insights = KeyedCache::new(Arc::clone(&clock), None);
        let insights_queue =
            InsightsProcessor::new(intelligence, insights.clone(), clock).into_queue(&config.batch);

        tracing::info!(
            default_language = %config.language.default_language,
            max_offline_messages = config.offline.max_messages,
            "Messaging core initialised"
        );

        Ok(Self {
            config,
            data_source: deps.data_source,
            subscriptions,
            preferences,
            detector,
            translations,
            offline,
            insights,
            insights_queue,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BabbleConfig {
        &self.config
    }

    pub fn subscriptions(&self) -> &SubscriptionManager<JsonValue> {
        &self.subscriptions
    }

    pub fn preferences(&self) -> &LanguagePreferenceResolver {
        &self.preferences
    }

    pub fn detector(&self) -> &LanguageDetector {
        &self.detector
    }

    pub fn translations(&self) -> &TranslationService {
        &self.translations
    }

    pub fn offline(&self) -> &OfflineMessageCache {
        &self.offline
    }

    pub fn insights(&self) -> &KeyedCache<ChatId, ConversationInsights> {
        &self.insights
    }

    pub fn insights_queue(&self) -> &DebouncedBatchProcessor<InsightRequest> {
        &self.insights_queue
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> BabbleResult<()> {
        if self.is_shut_down() {
            return Err(BabbleError::shut_down("messaging core"));
        }
        Ok(())
    }

    /// Attach to a live query with the configured default options.
    pub fn subscribe<F>(&self, query: QueryDescriptor, on_update: F) -> BabbleResult<SubscriptionHandle>
    where
        F: Fn(&SubscriptionUpdate<JsonValue>) + Send + Sync + 'static,
    {
        let options = SubscribeOptions::from_config(&self.config.subscriptions);
        self.subscribe_with(query, options, on_update)
    }

    pub fn subscribe_with<F>(
        &self,
        query: QueryDescriptor,
        options: SubscribeOptions,
        on_update: F,
    ) -> BabbleResult<SubscriptionHandle>
    where
        F: Fn(&SubscriptionUpdate<JsonValue>) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.subscriptions
            .subscribe_query(Arc::clone(&self.data_source), query, on_update, options)
    }

    pub async fn language_for(&self, user_id: &str) -> LanguagePreference {
        self.preferences.resolve(user_id, ResolveOptions::default()).await
    }

    pub async fn set_language(&self, user_id: &str, language: &str) -> BabbleResult<SupportedLanguage> {
        self.ensure_open()?;
        self.preferences.update(user_id, language).await
    }

    /// Translate `message` into `reader_id`'s preferred language.
    pub async fn display_message(&self, message: &Message, reader_id: &str) -> TranslationOutcome {
        let preference = self.language_for(reader_id).await;
        self.translations
            .translate_message(message, preference.language)
            .await
    }

    /// Queue a message for insight extraction on behalf of `actor_id`.
    /// Messages without text are ignored.
    pub fn queue_insights(&self, actor_id: &str, message: &Message) -> BabbleResult<()> {
        self.queue_insights_in_context(actor_id, message, &[])
    }

    /// Like [`queue_insights`](Self::queue_insights), sending earlier
    /// messages from `history` so references like "there" resolve.
    pub fn queue_insights_in_context(
        &self,
        actor_id: &str,
        message: &Message,
        history: &[Message],
    ) -> BabbleResult<()> {
        self.ensure_open()?;
        if !message.has_text() {
            return Ok(());
        }
        let context = preceding_texts(message, history, CONTEXT_MESSAGES);
        self.insights_queue
            .enqueue(actor_id, InsightRequest::for_message(message).with_context(context))
    }

    /// Persist a chat for offline reading, with any translations into
    /// `target` already cached.
    pub async fn save_offline(
        &self,
        chat_id: &str,
        messages: &[Message],
        target: SupportedLanguage,
    ) -> BabbleResult<CachedConversationSnapshot> {
        self.ensure_open()?;
        let translations = self.translations.translations_for(messages, target);
        self.offline.save(chat_id, messages, &translations).await
    }

    /// `fresh` messages merged over the offline snapshot of the chat.
    pub async fn load_offline(&self, chat_id: &str, fresh: &[Message]) -> Vec<Message> {
        self.offline.load_merged(chat_id, fresh).await
    }

    /// Flush the background queues and close every live subscription.
    ///
    /// Later calls return an empty report. Operations that start new work
    /// fail with [`BabbleError::ShutDown`] afterwards.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.closed.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }
        let insights = self.insights_queue.shutdown().await;
        let detections = self.detector.queue().shutdown().await;
        let subscriptions_closed = self.subscriptions.stats().active_records;
        self.subscriptions.shutdown();

        tracing::info!(
            insights_flushed = insights.as_ref().map_or(0, BatchReport::attempted),
            detections_flushed = detections.as_ref().map_or(0, BatchReport::attempted),
            subscriptions_closed,
            "Messaging core shut down"
        );
        ShutdownReport {
            insights,
            detections,
            subscriptions_closed,
        }
    }
}

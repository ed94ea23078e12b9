//! Message translation and conversation summaries, cached.
//!
//! Provider failures never reach the UI: a failed translation degrades to
//! [`TranslationOutcome::Unavailable`] carrying the original text.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use babble_core::clock::Clock;
use babble_core::{
    conversation_span_key, preceding_texts, BabbleConfig, BabbleResult, ChatId, ConversationSummary, Formality,
    LlmError, Message, MessageId, SupportedLanguage, TimeRange, TranslationResult,
    ValidationError,
};
use babble_llm::{ConversationLine, SummaryRequest, TextIntelligence, TranslationRequest};
use babble_storage::KeyedCache;

/// Preceding messages sent as context by
/// [`TranslationService::translate_in_context`].
pub const CONTEXT_MESSAGES: usize = 5;

/// Result of translating one message for display.
#[derive(Debug, Clone, PartialEq)]
pub enum TranslationOutcome {
    Translated(TranslationResult),
    /// The message is already in the target language.
    SameLanguage,
    /// No translation could be produced; show `fallback_text`.
    Unavailable { fallback_text: String },
}

impl TranslationOutcome {
    /// Text to render for a message whose original text is `original`.
    pub fn display_text<'a>(&'a self, original: &'a str) -> &'a str {
        match self {
            Self::Translated(result) => &result.translated_text,
            Self::SameLanguage => original,
            Self::Unavailable { fallback_text } => fallback_text,
        }
    }

    pub fn is_translated(&self) -> bool {
        matches!(self, Self::Translated(_))
    }
}

/// Translation cache key: message and target language.
pub type TranslationKey = (MessageId, SupportedLanguage);

/// Translates messages and summarizes conversations through a
/// [`TextIntelligence`] provider, caching both.
#[derive(Clone)]
pub struct TranslationService {
    intelligence: Arc<dyn TextIntelligence>,
    translations: KeyedCache<TranslationKey, TranslationResult>,
    summaries: KeyedCache<ChatId, ConversationSummary>,
    clock: Arc<dyn Clock>,
    translation_ttl: Duration,
    summary_ttl: Duration,
    summary_timeout: Duration,
    formality: Formality,
    cultural_context: bool,
}

impl std::fmt::Debug for TranslationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationService")
            .field("provider", &self.intelligence.provider_id())
            .field("translations", &self.translations.len())
            .field("summaries", &self.summaries.len())
            .finish()
    }
}

impl TranslationService {
    pub fn new(intelligence: Arc<dyn TextIntelligence>, clock: Arc<dyn Clock>, config: &BabbleConfig) -> Self {
        Self {
            intelligence,
            translations: KeyedCache::new(Arc::clone(&clock), None),
            summaries: KeyedCache::new(Arc::clone(&clock), None),
            clock,
            translation_ttl: config.cache.translation_ttl(),
            summary_ttl: config.cache.summary_ttl(),
            summary_timeout: config.intelligence.call_timeout(),
            formality: config.intelligence.formality,
            cultural_context: config.intelligence.cultural_context,
        }
    }

    pub fn translations(&self) -> &KeyedCache<TranslationKey, TranslationResult> {
        &self.translations
    }

    pub fn summaries(&self) -> &KeyedCache<ChatId, ConversationSummary> {
        &self.summaries
    }

    pub async fn translate_message(&self, message: &Message, target: SupportedLanguage) -> TranslationOutcome {
        self.translate_with(message, target, Vec::new()).await
    }

    /// Like [`translate_message`](Self::translate_message), sending up to
    /// five earlier text messages from `history` as context.
    pub async fn translate_in_context(
        &self,
        message: &Message,
        history: &[Message],
        target: SupportedLanguage,
    ) -> TranslationOutcome {
        let context = preceding_texts(message, history, CONTEXT_MESSAGES);
        self.translate_with(message, target, context).await
    }

    async fn translate_with(
        &self,
        message: &Message,
        target: SupportedLanguage,
        context: Vec<String>,
    ) -> TranslationOutcome {
        if !message.has_text() {
            return TranslationOutcome::Unavailable {
                fallback_text: message.text.clone(),
            };
        }
        if message.detected_language == Some(target) {
            return TranslationOutcome::SameLanguage;
        }
        let key = (message.id.clone(), target);
        if let Some(cached) = self.translations.get(&key) {
            return TranslationOutcome::Translated(cached);
        }

        let request = TranslationRequest {
            text: message.text.clone(),
            source_language: message.detected_language,
            target_language: target,
            formality: self.formality,
            cultural_context: self.cultural_context,
            context,
        };
        let translated = match self.intelligence.translate_text(&request).await {
            Ok(translated) => translated,
            Err(e) => {
                tracing::warn!(message_id = %message.id, target = %target, error = %e, "Translation unavailable");
                return TranslationOutcome::Unavailable {
                    fallback_text: message.text.clone(),
                };
            }
        };

        let source_language = translated
            .detected_source
            .as_deref()
            .and_then(SupportedLanguage::from_code)
            .or(message.detected_language);
        if source_language == Some(target) {
            return TranslationOutcome::SameLanguage;
        }

        let result = TranslationResult {
            message_id: message.id.clone(),
            source_language,
            target_language: target,
            translated_text: translated.text,
            cultural_notes: translated.cultural_notes,
            confidence: translated.confidence,
            translated_at: self.clock.now(),
        };
        self.translations
            .set_with_ttl(key, result.clone(), self.translation_ttl);
        tracing::debug!(message_id = %message.id, target = %target, "Cached translation");
        TranslationOutcome::Translated(result)
    }

    /// Cached translations of `messages` into `target`, keyed by message id.
    /// Never calls the provider.
    pub fn translations_for(
        &self,
        messages: &[Message],
        target: SupportedLanguage,
    ) -> HashMap<MessageId, TranslationResult> {
        messages
            .iter()
            .filter_map(|m| {
                self.translations
                    .get(&(m.id.clone(), target))
                    .map(|t| (m.id.clone(), t))
            })
            .collect()
    }

    /// Summarize a conversation in `target`.
    ///
    /// See [`summarize_range`](Self::summarize_range); every message is in
    /// range.
    pub async fn summarize(
        &self,
        chat_id: &str,
        messages: &[Message],
        target: SupportedLanguage,
    ) -> BabbleResult<ConversationSummary> {
        self.summarize_range(chat_id, messages, None, target).await
    }

    /// Summarize the text messages of a chat that fall inside `time_range`.
    ///
    /// The chat's cached summary is reused only when it is in `target` and
    /// was computed from exactly the same messages, so a new or edited
    /// message triggers a fresh summary. Non-text messages are ignored; no
    /// text in range is a validation error.
    pub async fn summarize_range(
        &self,
        chat_id: &str,
        messages: &[Message],
        time_range: Option<TimeRange>,
        target: SupportedLanguage,
    ) -> BabbleResult<ConversationSummary> {
        let mut selected: Vec<&Message> = messages
            .iter()
            .filter(|m| m.has_text())
            .filter(|m| time_range.map_or(true, |range| range.contains(m.timestamp)))
            .collect();
        if selected.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "messages".to_string(),
            }
            .into());
        }
        selected.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        let span_key = conversation_span_key(selected.iter().copied());

        let key = chat_id.to_string();
        if let Some(cached) = self.summaries.get(&key) {
            if cached.target_language == target && cached.span_key == span_key {
                return Ok(cached);
            }
        }

        let time_range = time_range.or_else(|| TimeRange::spanning(selected.iter().copied()));
        let request = SummaryRequest {
            lines: selected
                .iter()
                .map(|m| ConversationLine {
                    sender_id: m.sender_id.clone(),
                    text: m.text.clone(),
                    timestamp: m.timestamp,
                })
                .collect(),
            time_range,
            target_language: target,
        };
        let response = tokio::time::timeout(
            self.summary_timeout,
            self.intelligence.summarize_conversation(&request),
        )
        .await
        .map_err(|_| LlmError::Timeout {
            operation: "summarize_conversation".to_string(),
            after: self.summary_timeout,
        })??;

        let summary = ConversationSummary {
            chat_id: key.clone(),
            summary: response.summary,
            key_topics: response.key_topics,
            action_items: response.action_items,
            target_language: target,
            time_range,
            span_key,
            generated_at: self.clock.now(),
        };
        self.summaries.set_with_ttl(key, summary.clone(), self.summary_ttl);
        tracing::debug!(chat_id, lines = request.lines.len(), "Cached conversation summary");
        Ok(summary)
    }

    pub fn cached_summary(&self, chat_id: &str) -> Option<ConversationSummary> {
        self.summaries.get(&chat_id.to_string())
    }

    /// Drop the chat's cached summary, e.g. when new messages arrive.
    pub fn invalidate_summary(&self, chat_id: &str) -> bool {
        self.summaries.invalidate(&chat_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use babble_core::{BabbleError, MessageKind};
    use babble_llm::MockTextIntelligence;
    use babble_test_utils::{assertions, fixtures, ManualClock};

    fn service() -> (Arc<MockTextIntelligence>, Arc<ManualClock>, TranslationService) {
        let mock = Arc::new(MockTextIntelligence::new());
        let clock = fixtures::manual_clock();
        let service = TranslationService::new(mock.clone(), clock.clone(), &BabbleConfig::default());
        (mock, clock, service)
    }

    #[tokio::test]
    async fn test_translation_is_cached_per_target() {
        let (mock, _clock, service) = service();
        let message = fixtures::message("m1", "c1", "alice", "hello, see you tomorrow", 0);

        let outcome = service.translate_message(&message, SupportedLanguage::Spanish).await;
        let TranslationOutcome::Translated(result) = &outcome else {
            panic!("expected translation, got {outcome:?}");
        };
        assert_eq!(result.translated_text, "[es] hello, see you tomorrow");
        assert_eq!(result.source_language, Some(SupportedLanguage::English));
        assert_eq!(outcome.display_text(&message.text), "[es] hello, see you tomorrow");

        service.translate_message(&message, SupportedLanguage::Spanish).await;
        assert_eq!(mock.calls().translate, 1);

        service.translate_message(&message, SupportedLanguage::French).await;
        assert_eq!(mock.calls().translate, 2);
    }

    #[tokio::test]
    async fn test_same_language_is_not_translated() {
        let (mock, _clock, service) = service();
        let mut message = fixtures::message("m1", "c1", "alice", "hola amigo", 0);
        message.detected_language = Some(SupportedLanguage::Spanish);
        let outcome = service.translate_message(&message, SupportedLanguage::Spanish).await;
        assert_eq!(outcome, TranslationOutcome::SameLanguage);
        assert_eq!(outcome.display_text(&message.text), "hola amigo");
        assert_eq!(mock.calls().translate, 0);

        // Detected by the provider instead.
        let undetected = fixtures::message("m2", "c1", "alice", "gracias, buenos días", 0);
        let outcome = service.translate_message(&undetected, SupportedLanguage::Spanish).await;
        assert_eq!(outcome, TranslationOutcome::SameLanguage);
        assert!(service.translations().is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back_to_original() {
        let (mock, _clock, service) = service();
        mock.set_available(false);
        let message = fixtures::message("m1", "c1", "alice", "thanks!", 0);
        let outcome = service.translate_message(&message, SupportedLanguage::German).await;
        assert_eq!(
            outcome,
            TranslationOutcome::Unavailable {
                fallback_text: "thanks!".to_string()
            }
        );
        assert!(!outcome.is_translated());
        assert!(service.translations().is_empty());
    }

    #[tokio::test]
    async fn test_non_text_message_is_unavailable() {
        let (mock, _clock, service) = service();
        let mut message = fixtures::message("m1", "c1", "alice", "", 0);
        message.kind = MessageKind::Image;
        let outcome = service.translate_message(&message, SupportedLanguage::German).await;
        assert!(matches!(outcome, TranslationOutcome::Unavailable { .. }));
        assert_eq!(mock.calls().translate, 0);
    }

    #[tokio::test]
    async fn test_translations_for_collects_cached_only() {
        let (_mock, _clock, service) = service();
        let messages = fixtures::conversation("c1", 3);
        service.translate_message(&messages[0], SupportedLanguage::Korean).await;
        service.translate_message(&messages[2], SupportedLanguage::Korean).await;
        service.translate_message(&messages[1], SupportedLanguage::Hindi).await;

        let korean = service.translations_for(&messages, SupportedLanguage::Korean);
        assert_eq!(korean.len(), 2);
        assert!(korean.contains_key("m000"));
        assert!(korean.contains_key("m002"));
    }

    #[tokio::test]
    async fn test_translation_expires_with_ttl() {
        let (mock, clock, service) = service();
        let message = fixtures::message("m1", "c1", "alice", "what is this", 0);
        service.translate_message(&message, SupportedLanguage::Italian).await;
        clock.advance(BabbleConfig::default().cache.translation_ttl() + Duration::from_secs(1));
        assert!(service.translations_for(&[message.clone()], SupportedLanguage::Italian).is_empty());

        service.translate_message(&message, SupportedLanguage::Italian).await;
        assert_eq!(mock.calls().translate, 2);
    }

    #[tokio::test]
    async fn test_context_uses_latest_earlier_messages() {
        let (_mock, _clock, service) = service();
        let history = fixtures::conversation("c1", 8);
        let outcome = service
            .translate_in_context(&history[7], &history, SupportedLanguage::French)
            .await;
        assert!(outcome.is_translated());
    }

    #[tokio::test]
    async fn test_summary_cached_per_language() {
        let (mock, _clock, service) = service();
        let messages = fixtures::conversation("c1", 4);

        let english = service.summarize("c1", &messages, SupportedLanguage::English).await.unwrap();
        assert_eq!(english.summary, "4 messages from 2 participants.");
        service.summarize("c1", &messages, SupportedLanguage::English).await.unwrap();
        assert_eq!(mock.calls().summarize, 1);

        let spanish = service.summarize("c1", &messages, SupportedLanguage::Spanish).await.unwrap();
        assert!(spanish.summary.starts_with("[es]"));
        assert_eq!(mock.calls().summarize, 2);

        assert!(service.invalidate_summary("c1"));
        assert!(service.cached_summary("c1").is_none());
    }

    #[tokio::test]
    async fn test_new_message_refreshes_summary() {
        let (mock, _clock, service) = service();
        let first = fixtures::message("m1", "c1", "alice", "dinner on friday?", 0);
        let reply = fixtures::message("m2", "c1", "bob", "friday works", 5);

        let one = service.summarize("c1", &[first.clone()], SupportedLanguage::English).await.unwrap();
        assert_eq!(one.summary, "1 messages from 1 participants.");

        let two = service
            .summarize("c1", &[first.clone(), reply.clone()], SupportedLanguage::English)
            .await
            .unwrap();
        assert_eq!(two.summary, "2 messages from 2 participants.");
        assert_eq!(mock.calls().summarize, 2);
        assert_eq!(two.time_range, Some(TimeRange::new(first.timestamp, reply.timestamp)));

        // Same messages in another order reuse the cached summary.
        service
            .summarize("c1", &[reply.clone(), first.clone()], SupportedLanguage::English)
            .await
            .unwrap();
        assert_eq!(mock.calls().summarize, 2);

        let mut edited = reply;
        edited.text = "friday works, need to book".to_string();
        let three = service.summarize("c1", &[first, edited], SupportedLanguage::English).await.unwrap();
        assert_eq!(mock.calls().summarize, 3);
        assert_eq!(three.action_items, vec!["friday works, need to book".to_string()]);
    }

    #[tokio::test]
    async fn test_summarize_range_limits_messages() {
        let (mock, _clock, service) = service();
        let messages = fixtures::conversation("c1", 6);
        let range = TimeRange::new(fixtures::at(2), fixtures::at(3));

        let summary = service
            .summarize_range("c1", &messages, Some(range), SupportedLanguage::English)
            .await
            .unwrap();
        assert_eq!(summary.summary, "2 messages from 2 participants.");
        assert_eq!(summary.time_range, Some(range));

        let outside = TimeRange::new(fixtures::at(100), fixtures::at(200));
        let result = service
            .summarize_range("c1", &messages, Some(outside), SupportedLanguage::English)
            .await;
        assertions::assert_validation_error(&result);
        assert_eq!(mock.calls().summarize, 1);
    }

    #[tokio::test]
    async fn test_translation_uses_configured_register() {
        let mock = Arc::new(MockTextIntelligence::new());
        let mut config = BabbleConfig::default();
        config.intelligence.formality = Formality::Formal;
        config.intelligence.cultural_context = false;
        let service = TranslationService::new(mock, fixtures::manual_clock(), &config);

        let message = fixtures::message("m1", "c1", "alice", "hola amigo!", 0);
        let outcome = service.translate_message(&message, SupportedLanguage::English).await;
        let TranslationOutcome::Translated(result) = &outcome else {
            panic!("expected translation, got {outcome:?}");
        };
        assert_eq!(result.translated_text, "[en, formal] hola amigo!");
        assert!(result.cultural_notes.is_empty());
    }

    #[tokio::test]
    async fn test_summary_of_empty_conversation_is_rejected() {
        let (mock, _clock, service) = service();
        let result = service.summarize("c1", &[], SupportedLanguage::English).await;
        assertions::assert_validation_error(&result);
        assert_eq!(mock.calls().summarize, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_summary_times_out() {
        let (mock, _clock, service) = service();
        mock.set_latency(Duration::from_secs(60));
        let messages = fixtures::conversation("c1", 2);
        let err = service
            .summarize("c1", &messages, SupportedLanguage::English)
            .await
            .unwrap_err();
        assert!(matches!(err, BabbleError::Llm(LlmError::Timeout { .. })));
        assert!(service.cached_summary("c1").is_none());
    }
}

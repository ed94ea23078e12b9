//! Babble LLM - Text Intelligence Abstraction
//!
//! Provider-agnostic trait for the text analysis the chat client needs:
//! language detection, translation, structured extraction and conversation
//! summaries. Concrete providers are supplied by the embedding application;
//! this crate ships a deterministic [`MockTextIntelligence`] and a
//! [`TimeoutIntelligence`] wrapper that bounds every call.

pub mod mock;
pub mod timeout;

pub use mock::{CallCounts, MockTextIntelligence};
pub use timeout::TimeoutIntelligence;

pub use babble_core::{Formality, TimeRange};

use async_trait::async_trait;
use babble_core::{
    BabbleResult, Extraction, ExtractionKind, MessageId, SupportedLanguage, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// Raw language detection result.
///
/// Providers may detect languages outside the supported set, so the code is
/// kept as reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedLanguage {
    /// ISO 639-1 code or locale tag as reported by the provider.
    pub language_code: String,
    /// Confidence score (0.0 to 1.0)
    pub confidence: f32,
}

impl DetectedLanguage {
    /// The detected language if it belongs to the supported set.
    pub fn supported(&self) -> Option<SupportedLanguage> {
        SupportedLanguage::from_code(&self.language_code)
    }
}

/// A translation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub text: String,
    /// Known source language; `None` asks the provider to detect it.
    pub source_language: Option<SupportedLanguage>,
    pub target_language: SupportedLanguage,
    #[serde(default)]
    pub formality: Formality,
    /// Ask for notes on idioms and cultural references.
    #[serde(default)]
    pub cultural_context: bool,
    /// Preceding messages, oldest first, to disambiguate slang and tone.
    #[serde(default)]
    pub context: Vec<String>,
}

impl TranslationRequest {
    /// Neutral register, no cultural notes, no context.
    pub fn new(text: impl Into<String>, target_language: SupportedLanguage) -> Self {
        Self {
            text: text.into(),
            source_language: None,
            target_language,
            formality: Formality::Neutral,
            cultural_context: false,
            context: Vec::new(),
        }
    }
}

/// A translation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedText {
    pub text: String,
    /// Source language code as detected by the provider.
    pub detected_source: Option<String>,
    #[serde(default)]
    pub cultural_notes: Vec<String>,
    /// Confidence score (0.0 to 1.0)
    pub confidence: f32,
}

/// A structured extraction request for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub text: String,
    pub message_id: Option<MessageId>,
    /// Kinds to look for; empty means all.
    #[serde(default)]
    pub kinds: Vec<ExtractionKind>,
    /// Earlier messages in the chat, oldest first, used to resolve
    /// references such as "there" or "then".
    #[serde(default)]
    pub context: Vec<String>,
}

impl ExtractionRequest {
    pub fn wants(&self, kind: ExtractionKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// One line of conversation handed to the summarizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationLine {
    pub sender_id: UserId,
    pub text: String,
    pub timestamp: Timestamp,
}

/// A conversation summary request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub lines: Vec<ConversationLine>,
    /// Only lines inside this range are summarized; `None` means all.
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    pub target_language: SupportedLanguage,
}

impl SummaryRequest {
    /// Lines inside the requested time range.
    pub fn lines_in_range(&self) -> impl Iterator<Item = &ConversationLine> {
        self.lines
            .iter()
            .filter(move |line| self.time_range.map_or(true, |range| range.contains(line.timestamp)))
    }
}

/// A conversation summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub summary: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// Text analysis provider.
///
/// Implementations must be thread-safe (Send + Sync). Failures are reported
/// as [`babble_core::LlmError`]; callers degrade rather than surface them.
#[async_trait]
pub trait TextIntelligence: Send + Sync {
    /// Detect the language of `text`.
    async fn detect_language(&self, text: &str) -> BabbleResult<DetectedLanguage>;

    /// Translate text into the request's target language.
    async fn translate_text(&self, request: &TranslationRequest) -> BabbleResult<TranslatedText>;

    /// Pull dates, places, tasks and contacts out of a message.
    async fn extract_structured_data(&self, request: &ExtractionRequest) -> BabbleResult<Vec<Extraction>>;

    /// Summarize a span of conversation.
    async fn summarize_conversation(&self, request: &SummaryRequest) -> BabbleResult<SummaryResponse>;

    /// Identifier used in logs.
    fn provider_id(&self) -> &str;
}

#[async_trait]
impl<T: TextIntelligence + ?Sized> TextIntelligence for Arc<T> {
    async fn detect_language(&self, text: &str) -> BabbleResult<DetectedLanguage> {
        (**self).detect_language(text).await
    }

    async fn translate_text(&self, request: &TranslationRequest) -> BabbleResult<TranslatedText> {
        (**self).translate_text(request).await
    }

    async fn extract_structured_data(&self, request: &ExtractionRequest) -> BabbleResult<Vec<Extraction>> {
        (**self).extract_structured_data(request).await
    }

    async fn summarize_conversation(&self, request: &SummaryRequest) -> BabbleResult<SummaryResponse> {
        (**self).summarize_conversation(request).await
    }

    fn provider_id(&self) -> &str {
        (**self).provider_id()
    }
}

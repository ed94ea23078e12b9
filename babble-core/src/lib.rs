//! Babble Core - Domain Types
//!
//! Plain data structures shared by every other crate in the workspace:
//! messages, translations, insights, language preferences, the error
//! taxonomy and configuration. This crate holds no caching or I/O logic.

pub mod clock;
pub mod config;
pub mod error;
pub mod language;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use error::*;
pub use language::{LanguageParseError, SupportedLanguage};
pub use retry::{retry_with_backoff, RetryPolicy};

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Identifier of a user profile in the remote data source.
pub type UserId = String;

/// Identifier of a chat (one-to-one or group conversation).
pub type ChatId = String;

/// Identifier of a single message inside a chat.
pub type MessageId = String;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash used to key derived data (detections, summaries).
pub type ContentHash = [u8; 32];

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Hex-encoded content hash of normalised text.
///
/// Normalisation trims surrounding whitespace and lowercases, so "Hola " and
/// "hola" share a key.
pub fn text_cache_key(text: &str) -> String {
    let normalised = text.trim().to_lowercase();
    hex::encode(compute_content_hash(normalised.as_bytes()))
}

/// Best-effort text of a caught panic payload, for logging.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Kind of content carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Voice,
}

/// A chat message as delivered by the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub text: String,
    pub kind: MessageKind,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<SupportedLanguage>,
}

impl Message {
    /// Create a plain text message.
    pub fn text(
        id: impl Into<MessageId>,
        chat_id: impl Into<ChatId>,
        sender_id: impl Into<UserId>,
        text: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            kind: MessageKind::Text,
            timestamp,
            detected_language: None,
        }
    }

    /// Whether this message carries text worth translating or analysing.
    pub fn has_text(&self) -> bool {
        self.kind == MessageKind::Text && !self.text.trim().is_empty()
    }
}

/// Sort messages chronologically, breaking timestamp ties by id so the order
/// is total and stable across runs.
pub fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

/// Texts of up to `limit` messages from `history` sent before `message`,
/// oldest first. Non-text messages and `message` itself are skipped.
pub fn preceding_texts(message: &Message, history: &[Message], limit: usize) -> Vec<String> {
    let mut earlier: Vec<&Message> = history
        .iter()
        .filter(|m| m.id != message.id && m.has_text() && m.timestamp <= message.timestamp)
        .collect();
    earlier.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    let skip = earlier.len().saturating_sub(limit);
    earlier.into_iter().skip(skip).map(|m| m.text.clone()).collect()
}

// ============================================================================
// TRANSLATION / INTELLIGENCE RESULTS
// ============================================================================

/// A translation of one message into one target language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationResult {
    pub message_id: MessageId,
    pub source_language: Option<SupportedLanguage>,
    pub target_language: SupportedLanguage,
    pub translated_text: String,
    #[serde(default)]
    pub cultural_notes: Vec<String>,
    pub confidence: f32,
    pub translated_at: Timestamp,
}

/// Result of a language detection call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageDetection {
    /// Detected language, `None` when the text was too short or the
    /// detected language is outside the supported set.
    pub language: Option<SupportedLanguage>,
    /// Confidence score (0.0 to 1.0)
    pub confidence: f32,
    pub detected_at: Timestamp,
}

/// Category of a structured extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionKind {
    Date,
    Location,
    Task,
    Contact,
    Other,
}

/// A single structured item pulled out of message text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    pub kind: ExtractionKind,
    pub text: String,
    pub confidence: f32,
    pub source_message_id: Option<MessageId>,
}

/// Accumulated structured insights for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationInsights {
    pub chat_id: ChatId,
    pub extractions: Vec<Extraction>,
    pub updated_at: Timestamp,
}

impl ConversationInsights {
    /// Create an empty insight set for a chat.
    pub fn empty(chat_id: impl Into<ChatId>, updated_at: Timestamp) -> Self {
        Self {
            chat_id: chat_id.into(),
            extractions: Vec::new(),
            updated_at,
        }
    }

    /// Merge new extractions, replacing any earlier extraction of the same
    /// kind taken from the same message. Several extractions of one kind in
    /// the incoming batch are all kept.
    pub fn merge(&mut self, extractions: Vec<Extraction>, updated_at: Timestamp) {
        let replaced: HashSet<(ExtractionKind, &MessageId)> = extractions
            .iter()
            .filter_map(|e| e.source_message_id.as_ref().map(|id| (e.kind, id)))
            .collect();
        self.extractions.retain(|existing| match &existing.source_message_id {
            Some(id) => !replaced.contains(&(existing.kind, id)),
            None => true,
        });
        self.extractions.extend(extractions);
        self.updated_at = updated_at;
    }
}

/// Register a translation should be written in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Formality {
    Casual,
    #[default]
    Neutral,
    Formal,
}

/// Inclusive span of conversation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    /// Bounds are reordered so `start <= end`.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        self.start <= at && at <= self.end
    }

    /// Smallest range covering every message, `None` when empty.
    pub fn spanning<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Option<Self> {
        messages.into_iter().fold(None, |range: Option<Self>, m| {
            Some(match range {
                Some(r) => Self {
                    start: r.start.min(m.timestamp),
                    end: r.end.max(m.timestamp),
                },
                None => Self {
                    start: m.timestamp,
                    end: m.timestamp,
                },
            })
        })
    }
}

/// Hex SHA-256 over the ids and texts of `messages`, in order.
///
/// Identifies exactly which messages a derived artifact (a summary) was
/// computed from; an added or edited message changes the key.
pub fn conversation_span_key<'a>(messages: impl IntoIterator<Item = &'a Message>) -> String {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(message.id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(message.text.as_bytes());
        hasher.update(b"\x1e");
    }
    hex::encode(hasher.finalize())
}

/// Summary of a span of conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub chat_id: ChatId,
    pub summary: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    pub target_language: SupportedLanguage,
    /// Time span of the summarized messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    /// [`conversation_span_key`] of the summarized messages.
    #[serde(default)]
    pub span_key: String,
    pub generated_at: Timestamp,
}

// ============================================================================
// LANGUAGE PREFERENCE
// ============================================================================

/// Where a resolved language preference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferenceSource {
    Cache,
    Remote,
    Device,
    Default,
}

impl PreferenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Remote => "remote",
            Self::Device => "device",
            Self::Default => "default",
        }
    }
}

impl std::fmt::Display for PreferenceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's resolved language preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguagePreference {
    pub user_id: UserId,
    pub language: SupportedLanguage,
    pub source: PreferenceSource,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_text_cache_key_normalises() {
        assert_eq!(text_cache_key("Hola "), text_cache_key("hola"));
        assert_ne!(text_cache_key("hola"), text_cache_key("adios"));
        assert_eq!(text_cache_key("x").len(), 64);
    }

    #[test]
    fn test_sort_chronologically_breaks_ties_by_id() {
        let mut messages = vec![
            Message::text("b", "c1", "u1", "second", at(10)),
            Message::text("a", "c1", "u1", "first", at(10)),
            Message::text("z", "c1", "u1", "zeroth", at(5)),
        ];
        sort_chronologically(&mut messages);
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }

    #[test]
    fn test_preceding_texts_takes_latest_earlier_messages() {
        let mut history: Vec<Message> = (0..6)
            .map(|i| Message::text(format!("m{i}"), "c1", "u1", format!("text {i}"), at(i)))
            .collect();
        history[1].kind = MessageKind::Image;
        let current = history[4].clone();
        assert_eq!(
            preceding_texts(&current, &history, 2),
            vec!["text 2".to_string(), "text 3".to_string()]
        );
        assert_eq!(preceding_texts(&current, &history, 10).len(), 3);
        assert!(preceding_texts(&history[0], &history, 5).is_empty());
    }

    #[test]
    fn test_message_has_text() {
        let mut message = Message::text("m1", "c1", "u1", "  ", at(0));
        assert!(!message.has_text());
        message.text = "hi".to_string();
        assert!(message.has_text());
        message.kind = MessageKind::Image;
        assert!(!message.has_text());
    }

    #[test]
    fn test_message_serde_uses_camel_case() {
        let message = Message::text("m1", "c1", "u1", "hi", at(0));
        let json = serde_json::to_value(&message).unwrap();
        assert!(json.get("chatId").is_some());
        assert!(json.get("senderId").is_some());
        assert!(json.get("detectedLanguage").is_none());
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_insights_merge_replaces_same_kind_same_message() {
        let mut insights = ConversationInsights::empty("c1", at(0));
        insights.merge(
            vec![Extraction {
                kind: ExtractionKind::Date,
                text: "Friday".to_string(),
                confidence: 0.7,
                source_message_id: Some("m1".to_string()),
            }],
            at(1),
        );
        insights.merge(
            vec![
                Extraction {
                    kind: ExtractionKind::Date,
                    text: "Saturday".to_string(),
                    confidence: 0.9,
                    source_message_id: Some("m1".to_string()),
                },
                Extraction {
                    kind: ExtractionKind::Location,
                    text: "Lisbon".to_string(),
                    confidence: 0.8,
                    source_message_id: Some("m1".to_string()),
                },
            ],
            at(2),
        );
        assert_eq!(insights.extractions.len(), 2);
        assert_eq!(insights.extractions[0].text, "Saturday");
        assert_eq!(insights.updated_at, at(2));
    }

    #[test]
    fn test_insights_merge_keeps_every_extraction_of_one_message() {
        let date = |text: &str| Extraction {
            kind: ExtractionKind::Date,
            text: text.to_string(),
            confidence: 0.8,
            source_message_id: Some("m1".to_string()),
        };
        let mut insights = ConversationInsights::empty("c1", at(0));
        insights.merge(vec![date("Monday"), date("Tuesday")], at(1));
        let texts: Vec<&str> = insights.extractions.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["Monday", "Tuesday"]);

        insights.merge(vec![date("Friday")], at(2));
        let texts: Vec<&str> = insights.extractions.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["Friday"]);
    }

    #[test]
    fn test_time_range_spanning_and_contains() {
        let messages = vec![
            Message::text("b", "c1", "u1", "later", at(30)),
            Message::text("a", "c1", "u1", "earlier", at(10)),
        ];
        let range = TimeRange::spanning(&messages).unwrap();
        assert_eq!(range, TimeRange::new(at(30), at(10)));
        assert!(range.contains(at(10)));
        assert!(range.contains(at(30)));
        assert!(!range.contains(at(31)));
        assert!(TimeRange::spanning(&Vec::<Message>::new()).is_none());
    }

    #[test]
    fn test_span_key_tracks_messages_and_edits() {
        let m1 = Message::text("m1", "c1", "u1", "hi", at(0));
        let m2 = Message::text("m2", "c1", "u2", "hello", at(1));
        let one = conversation_span_key([&m1]);
        let two = conversation_span_key([&m1, &m2]);
        assert_ne!(one, two);
        assert_eq!(one, conversation_span_key(std::iter::once(&m1)));

        let mut edited = m1.clone();
        edited.text = "hi there".to_string();
        assert_ne!(one, conversation_span_key([&edited]));
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let payload = std::panic::catch_unwind(|| panic!("listener {} failed", 3)).unwrap_err();
        assert_eq!(panic_message(&*payload), "listener 3 failed");
        let payload = std::panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }

    #[test]
    fn test_preference_source_display() {
        assert_eq!(PreferenceSource::Default.to_string(), "default");
        assert_eq!(PreferenceSource::Cache.as_str(), "cache");
    }
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

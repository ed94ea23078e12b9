//! Deterministic text intelligence for tests and offline demos.
//!
//! Detection uses script ranges and a small per-language word list;
//! translation tags the text with the target code (and the register, when
//! not neutral); extraction and summaries are keyword heuristics. Failures
//! and latency can be injected.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use babble_core::{BabbleResult, Extraction, ExtractionKind, Formality, LlmError, SupportedLanguage};

use crate::{
    ConversationLine, DetectedLanguage, ExtractionRequest, SummaryRequest, SummaryResponse,
    TextIntelligence, TranslatedText, TranslationRequest,
};

const LEXICON: &[(&str, &[&str])] = &[
    ("en", &["hello", "thanks", "the", "is", "are", "you", "tomorrow", "and", "what", "how", "see"]),
    ("es", &["hola", "gracias", "qué", "por", "favor", "buenos", "días", "cómo", "estás", "amigo", "mañana", "nos", "vemos"]),
    ("fr", &["bonjour", "merci", "oui", "je", "suis", "avec", "pour", "salut", "demain", "ça", "va"]),
    ("de", &["hallo", "danke", "ich", "bin", "und", "nicht", "morgen", "gut", "bitte", "wie", "geht"]),
    ("it", &["ciao", "grazie", "sono", "stai", "bene", "domani", "allora", "buongiorno"]),
    ("pt", &["olá", "obrigado", "obrigada", "você", "bom", "dia", "amanhã", "tudo", "bem"]),
];

const DATE_WORDS: &[&str] = &[
    "today", "tomorrow", "tonight", "monday", "tuesday", "wednesday", "thursday", "friday",
    "saturday", "sunday", "weekend",
];

const TASK_MARKERS: &[&str] = &["need to", "remember to", "don't forget", "todo", "please"];

/// Per-operation call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub detect: u64,
    pub translate: u64,
    pub extract: u64,
    pub summarize: u64,
}

impl CallCounts {
    pub fn total(&self) -> u64 {
        self.detect + self.translate + self.extract + self.summarize
    }
}

/// Mock text intelligence provider.
#[derive(Debug)]
pub struct MockTextIntelligence {
    provider_id: String,
    latency_ms: AtomicU64,
    offline: AtomicBool,
    failures_remaining: AtomicU32,
    detect_calls: AtomicU64,
    translate_calls: AtomicU64,
    extract_calls: AtomicU64,
    summarize_calls: AtomicU64,
}

impl Default for MockTextIntelligence {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTextIntelligence {
    pub fn new() -> Self {
        Self {
            provider_id: "mock".to_string(),
            latency_ms: AtomicU64::new(0),
            offline: AtomicBool::new(false),
            failures_remaining: AtomicU32::new(0),
            detect_calls: AtomicU64::new(0),
            translate_calls: AtomicU64::new(0),
            extract_calls: AtomicU64::new(0),
            summarize_calls: AtomicU64::new(0),
        }
    }

    /// Delay every call by `latency` (tokio time).
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Fail every call while unavailable.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::Relaxed);
    }

    /// Fail the next `count` calls, then recover.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::Relaxed);
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            detect: self.detect_calls.load(Ordering::Relaxed),
            translate: self.translate_calls.load(Ordering::Relaxed),
            extract: self.extract_calls.load(Ordering::Relaxed),
            summarize: self.summarize_calls.load(Ordering::Relaxed),
        }
    }

    async fn begin(&self, operation: &str, counter: &AtomicU64) -> BabbleResult<()> {
        counter.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::Relaxed) {
            return Err(unavailable(operation, "provider offline"));
        }
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(unavailable(operation, "injected failure"));
        }
        Ok(())
    }
}

fn unavailable(operation: &str, reason: &str) -> babble_core::BabbleError {
    LlmError::Unavailable {
        operation: operation.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn script_language(text: &str) -> Option<&'static str> {
    let mut han = false;
    for c in text.chars() {
        match c as u32 {
            0x3040..=0x30FF => return Some("ja"),
            0xAC00..=0xD7AF | 0x1100..=0x11FF => return Some("ko"),
            0x0600..=0x06FF => return Some("ar"),
            0x0400..=0x04FF => return Some("ru"),
            0x0900..=0x097F => return Some("hi"),
            0x4E00..=0x9FFF => han = true,
            _ => {}
        }
    }
    han.then_some("zh")
}

/// Heuristic detection shared by `detect_language` and `translate_text`.
fn detect(text: &str) -> DetectedLanguage {
    if let Some(code) = script_language(text) {
        return DetectedLanguage {
            language_code: code.to_string(),
            confidence: 0.95,
        };
    }

    let tokens = words(text);
    let (code, hits) = LEXICON
        .iter()
        .map(|(code, lexicon)| {
            let hits = tokens.iter().filter(|t| lexicon.contains(&t.as_str())).count();
            (*code, hits)
        })
        // First entry wins ties, so English is preferred.
        .fold(("en", 0usize), |best, candidate| {
            if candidate.1 > best.1 {
                candidate
            } else {
                best
            }
        });

    DetectedLanguage {
        language_code: code.to_string(),
        confidence: if hits == 0 {
            0.3
        } else {
            (0.6 + 0.1 * hits as f32).min(0.99)
        },
    }
}

fn tag(language: SupportedLanguage, text: &str) -> String {
    format!("[{}] {}", language.code(), text)
}

fn tag_with_register(language: SupportedLanguage, formality: Formality, text: &str) -> String {
    match formality {
        Formality::Neutral => tag(language, text),
        Formality::Casual => format!("[{}, casual] {}", language.code(), text),
        Formality::Formal => format!("[{}, formal] {}", language.code(), text),
    }
}

/// Capitalised words following "at" or "in".
fn places(text: &str) -> Vec<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    tokens
        .windows(2)
        .filter(|pair| pair[0].eq_ignore_ascii_case("at") || pair[0].eq_ignore_ascii_case("in"))
        .map(|pair| pair[1].trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|place| place.chars().next().is_some_and(char::is_uppercase))
        .map(str::to_string)
        .collect()
}

fn has_task_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    TASK_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[async_trait]
impl TextIntelligence for MockTextIntelligence {
    async fn detect_language(&self, text: &str) -> BabbleResult<DetectedLanguage> {
        self.begin("detect_language", &self.detect_calls).await?;
        Ok(detect(text))
    }

    async fn translate_text(&self, request: &TranslationRequest) -> BabbleResult<TranslatedText> {
        self.begin("translate_text", &self.translate_calls).await?;
        let source = match request.source_language {
            Some(language) => language.code().to_string(),
            None => detect(&request.text).language_code,
        };

        if SupportedLanguage::from_code(&source) == Some(request.target_language) {
            return Ok(TranslatedText {
                text: request.text.clone(),
                detected_source: Some(source),
                cultural_notes: Vec::new(),
                confidence: 1.0,
            });
        }

        let cultural_notes = if request.cultural_context && request.text.contains('!') {
            vec!["Exclamation conveys enthusiasm rather than urgency.".to_string()]
        } else {
            Vec::new()
        };
        Ok(TranslatedText {
            text: tag_with_register(request.target_language, request.formality, &request.text),
            detected_source: Some(source),
            cultural_notes,
            confidence: 0.9,
        })
    }

    async fn extract_structured_data(&self, request: &ExtractionRequest) -> BabbleResult<Vec<Extraction>> {
        self.begin("extract_structured_data", &self.extract_calls).await?;
        let mut found = Vec::new();
        let mut push = |kind: ExtractionKind, text: String, confidence: f32| {
            if request.wants(kind) {
                found.push(Extraction {
                    kind,
                    text,
                    confidence,
                    source_message_id: request.message_id.clone(),
                });
            }
        };

        let raw_tokens: Vec<&str> = request.text.split_whitespace().collect();
        for token in words(&request.text) {
            if DATE_WORDS.contains(&token.as_str()) {
                push(ExtractionKind::Date, token, 0.8);
            }
        }
        for place in places(&request.text) {
            push(ExtractionKind::Location, place, 0.6);
        }
        // "there" refers to the most recent place named in context.
        if words(&request.text).iter().any(|w| w == "there") {
            if let Some(place) = request.context.iter().rev().find_map(|line| places(line).pop()) {
                push(ExtractionKind::Location, place, 0.4);
            }
        }
        for token in &raw_tokens {
            let token = token.trim_matches(|c: char| c == ',' || c == ';' || c == '!' || c == '?');
            let token = token.strip_suffix('.').unwrap_or(token);
            let digits = token.chars().filter(char::is_ascii_digit).count();
            if (token.contains('@') && token.contains('.')) || digits >= 7 {
                push(ExtractionKind::Contact, token.to_string(), 0.9);
            }
        }
        if has_task_marker(&request.text) {
            push(ExtractionKind::Task, request.text.trim().to_string(), 0.7);
        }

        Ok(found)
    }

    async fn summarize_conversation(&self, request: &SummaryRequest) -> BabbleResult<SummaryResponse> {
        self.begin("summarize_conversation", &self.summarize_calls).await?;
        let lines: Vec<&ConversationLine> = request.lines_in_range().collect();
        if lines.is_empty() {
            return Err(LlmError::InvalidResponse {
                operation: "summarize_conversation".to_string(),
                reason: "nothing to summarize".to_string(),
            }
            .into());
        }

        let participants: HashSet<&str> = lines.iter().map(|l| l.sender_id.as_str()).collect();
        let mut frequency: BTreeMap<String, usize> = BTreeMap::new();
        for line in &lines {
            for word in words(&line.text).into_iter().filter(|w| w.chars().count() >= 5) {
                *frequency.entry(word).or_default() += 1;
            }
        }
        let mut ranked: Vec<(String, usize)> = frequency.into_iter().collect();
        // Stable sort keeps alphabetical order among equal counts.
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        let key_topics = ranked.into_iter().take(3).map(|(word, _)| word).collect();

        let action_items = lines
            .iter()
            .filter(|line| has_task_marker(&line.text))
            .map(|line| line.text.trim().to_string())
            .collect();

        let summary = format!(
            "{} messages from {} participants.",
            lines.len(),
            participants.len()
        );
        let summary = if request.target_language == SupportedLanguage::English {
            summary
        } else {
            tag(request.target_language, &summary)
        };

        Ok(SummaryResponse {
            summary,
            key_topics,
            action_items,
        })
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TimeRange;
    use chrono::{TimeZone, Utc};

    fn translation(text: &str, target: SupportedLanguage) -> TranslationRequest {
        TranslationRequest {
            cultural_context: true,
            ..TranslationRequest::new(text, target)
        }
    }

    fn line(sender_id: &str, text: &str, secs: i64) -> ConversationLine {
        ConversationLine {
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_detects_scripts_and_lexicon() {
        let mock = MockTextIntelligence::new();
        let cases = [
            ("Hola amigo, ¿cómo estás?", "es"),
            ("Bonjour, merci beaucoup", "fr"),
            ("こんにちは", "ja"),
            ("你好", "zh"),
            ("안녕하세요", "ko"),
            ("Привет", "ru"),
            ("مرحبا", "ar"),
            ("नमस्ते", "hi"),
            ("see you tomorrow", "en"),
        ];
        for (text, expected) in cases {
            let detected = mock.detect_language(text).await.unwrap();
            assert_eq!(detected.language_code, expected, "text: {text}");
        }
        assert_eq!(mock.calls().detect, cases.len() as u64);
    }

    #[tokio::test]
    async fn test_unknown_text_defaults_to_low_confidence_english() {
        let mock = MockTextIntelligence::new();
        let detected = mock.detect_language("xyzzy").await.unwrap();
        assert_eq!(detected.language_code, "en");
        assert!(detected.confidence < 0.5);
    }

    #[tokio::test]
    async fn test_translate_tags_target_and_passes_same_language() {
        let mock = MockTextIntelligence::new();
        let translated = mock
            .translate_text(&translation("Hola amigo!", SupportedLanguage::English))
            .await
            .unwrap();
        assert_eq!(translated.text, "[en] Hola amigo!");
        assert_eq!(translated.detected_source.as_deref(), Some("es"));
        assert_eq!(translated.cultural_notes.len(), 1);

        let same = mock
            .translate_text(&translation("Hola amigo", SupportedLanguage::Spanish))
            .await
            .unwrap();
        assert_eq!(same.text, "Hola amigo");
        assert_eq!(same.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_translate_honours_register_and_cultural_context() {
        let mock = MockTextIntelligence::new();
        let formal = TranslationRequest {
            formality: Formality::Formal,
            ..TranslationRequest::new("Hola amigo!", SupportedLanguage::English)
        };
        let translated = mock.translate_text(&formal).await.unwrap();
        assert_eq!(translated.text, "[en, formal] Hola amigo!");
        assert!(translated.cultural_notes.is_empty());

        let casual = TranslationRequest {
            formality: Formality::Casual,
            cultural_context: true,
            ..TranslationRequest::new("Hola amigo!", SupportedLanguage::German)
        };
        let translated = mock.translate_text(&casual).await.unwrap();
        assert_eq!(translated.text, "[de, casual] Hola amigo!");
        assert_eq!(translated.cultural_notes.len(), 1);
    }

    #[tokio::test]
    async fn test_extracts_each_kind() {
        let mock = MockTextIntelligence::new();
        let request = ExtractionRequest {
            text: "Please meet at Lisbon tomorrow, call 5551234567 or ana@example.com.".to_string(),
            message_id: Some("m1".to_string()),
            kinds: Vec::new(),
            context: Vec::new(),
        };
        let found = mock.extract_structured_data(&request).await.unwrap();
        let kinds: HashSet<ExtractionKind> = found.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            HashSet::from([
                ExtractionKind::Date,
                ExtractionKind::Location,
                ExtractionKind::Contact,
                ExtractionKind::Task,
            ])
        );
        assert!(found.iter().any(|e| e.text == "Lisbon"));
        assert!(found.iter().any(|e| e.text == "ana@example.com"));
        assert!(found.iter().all(|e| e.source_message_id.as_deref() == Some("m1")));
    }

    #[tokio::test]
    async fn test_extraction_respects_requested_kinds() {
        let mock = MockTextIntelligence::new();
        let request = ExtractionRequest {
            text: "Please come tomorrow".to_string(),
            message_id: None,
            kinds: vec![ExtractionKind::Date],
            context: Vec::new(),
        };
        let found = mock.extract_structured_data(&request).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ExtractionKind::Date);
    }

    #[tokio::test]
    async fn test_extraction_resolves_place_from_context() {
        let mock = MockTextIntelligence::new();
        let request = ExtractionRequest {
            text: "ok, see you there".to_string(),
            message_id: Some("m3".to_string()),
            kinds: vec![ExtractionKind::Location],
            context: vec![
                "lunch in Porto?".to_string(),
                "no, dinner at Lisbon".to_string(),
            ],
        };
        let found = mock.extract_structured_data(&request).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "Lisbon");

        let without_context = ExtractionRequest {
            context: Vec::new(),
            ..request
        };
        assert!(mock.extract_structured_data(&without_context).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summarize() {
        let mock = MockTextIntelligence::new();
        let request = SummaryRequest {
            lines: vec![
                line("u1", "Dinner plans for Friday?", 0),
                line("u2", "Friday dinner works, need to book", 10),
            ],
            time_range: None,
            target_language: SupportedLanguage::Spanish,
        };
        let summary = mock.summarize_conversation(&request).await.unwrap();
        assert_eq!(summary.summary, "[es] 2 messages from 2 participants.");
        assert_eq!(summary.key_topics[..2], ["dinner".to_string(), "friday".to_string()]);
        assert_eq!(summary.action_items, vec!["Friday dinner works, need to book".to_string()]);
    }

    #[tokio::test]
    async fn test_summarize_only_the_requested_range() {
        let mock = MockTextIntelligence::new();
        let at = |secs| Utc.timestamp_opt(secs, 0).single().unwrap();
        let mut request = SummaryRequest {
            lines: vec![
                line("u1", "old news", 0),
                line("u2", "please bring snacks", 100),
                line("u1", "sure thing", 110),
            ],
            time_range: Some(TimeRange::new(at(50), at(200))),
            target_language: SupportedLanguage::English,
        };
        let summary = mock.summarize_conversation(&request).await.unwrap();
        assert_eq!(summary.summary, "2 messages from 2 participants.");
        assert_eq!(summary.action_items, vec!["please bring snacks".to_string()]);

        request.time_range = Some(TimeRange::new(at(500), at(600)));
        let err = mock.summarize_conversation(&request).await.unwrap_err();
        assert!(matches!(err, babble_core::BabbleError::Llm(LlmError::InvalidResponse { .. })));
    }

    #[tokio::test]
    async fn test_injected_failures_then_recovery() {
        let mock = MockTextIntelligence::new();
        mock.fail_next(2);
        assert!(mock.detect_language("hola").await.is_err());
        assert!(mock.detect_language("hola").await.is_err());
        assert!(mock.detect_language("hola").await.is_ok());

        mock.set_available(false);
        let err = mock.detect_language("hola").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(mock.calls().total(), 4);
    }
}

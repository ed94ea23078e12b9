//! Language detection with a content-addressed cache.
//!
//! Results are keyed by [`text_cache_key`], so the same sentence typed by two
//! users, or with different casing, costs one provider call per TTL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use babble_core::clock::Clock;
use babble_core::{text_cache_key, BabbleConfig, BabbleResult, LanguageDetection};
use babble_batch::{
    ActorRateLimiter, BatchHandler, BatchPayload, DebouncedBatchProcessor, ProcessorSettings,
    QueueItem,
};
use babble_llm::TextIntelligence;
use babble_storage::KeyedCache;

/// Text queued for background detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionRequest {
    pub text: String,
}

impl BatchPayload for DetectionRequest {
    fn text(&self) -> &str {
        &self.text
    }

    fn dedupe_key(&self) -> Option<String> {
        Some(text_cache_key(&self.text))
    }
}

struct DetectorCore {
    intelligence: Arc<dyn TextIntelligence>,
    cache: KeyedCache<String, LanguageDetection>,
    clock: Arc<dyn Clock>,
    min_chars: usize,
    ttl: Duration,
}

impl DetectorCore {
    fn too_short(&self, text: &str) -> bool {
        text.trim().chars().count() < self.min_chars
    }

    fn undetermined(&self) -> LanguageDetection {
        LanguageDetection {
            language: None,
            confidence: 0.0,
            detected_at: self.clock.now(),
        }
    }

    /// Call the provider and cache the result. No rate check.
    async fn detect_and_cache(&self, key: String, text: &str) -> BabbleResult<LanguageDetection> {
        let detected = self.intelligence.detect_language(text).await?;
        let detection = LanguageDetection {
            language: detected.supported(),
            confidence: detected.confidence,
            detected_at: self.clock.now(),
        };
        if detection.language.is_none() {
            tracing::debug!(code = %detected.language_code, "Detected language is not supported");
        }
        self.cache.set_with_ttl(key, detection.clone(), self.ttl);
        Ok(detection)
    }
}

/// Drains scheduled detections. The enqueue already spent the actor's rate
/// budget, so the handler calls the provider directly.
struct ScheduledDetections {
    core: Arc<DetectorCore>,
}

#[async_trait]
impl BatchHandler<DetectionRequest> for ScheduledDetections {
    async fn handle(&self, item: &QueueItem<DetectionRequest>) -> BabbleResult<()> {
        let text = &item.payload.text;
        let key = text_cache_key(text);
        if self.core.cache.get(&key).is_some() {
            return Ok(());
        }
        self.core.detect_and_cache(key, text).await.map(|_| ())
    }
}

/// Cached, rate limited language detection.
#[derive(Clone)]
pub struct LanguageDetector {
    core: Arc<DetectorCore>,
    limiter: ActorRateLimiter,
    queue: DebouncedBatchProcessor<DetectionRequest>,
}

impl std::fmt::Debug for LanguageDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageDetector")
            .field("cached", &self.core.cache.len())
            .field("min_chars", &self.core.min_chars)
            .field("queue", &self.queue)
            .finish()
    }
}

impl LanguageDetector {
    pub fn new(
        intelligence: Arc<dyn TextIntelligence>,
        cache: KeyedCache<String, LanguageDetection>,
        clock: Arc<dyn Clock>,
        config: &BabbleConfig,
    ) -> Self {
        let core = Arc::new(DetectorCore {
            intelligence,
            cache,
            clock: Arc::clone(&clock),
            min_chars: config.language.min_detection_chars,
            ttl: config.cache.detection_ttl(),
        });
        let limiter = ActorRateLimiter::from_config(&config.batch);
        let queue = DebouncedBatchProcessor::new(
            Arc::new(ScheduledDetections {
                core: Arc::clone(&core),
            }),
            limiter.clone(),
            ProcessorSettings::from_config("language detection", &config.batch),
            clock,
        );
        Self {
            core,
            limiter,
            queue,
        }
    }

    /// Detect the language of `text` on behalf of `user_id`.
    ///
    /// Text shorter than the configured minimum yields an undetermined
    /// result without calling the provider. Cache hits are free; misses
    /// spend one unit of the user's rate budget.
    pub async fn detect(&self, user_id: &str, text: &str) -> BabbleResult<LanguageDetection> {
        if self.core.too_short(text) {
            return Ok(self.core.undetermined());
        }
        let key = text_cache_key(text);
        if let Some(hit) = self.core.cache.get(&key) {
            return Ok(hit);
        }
        self.limiter.check(user_id)?;
        self.core.detect_and_cache(key, text).await
    }

    /// Queue `text` for background detection. The result lands in
    /// [`cache`](Self::cache), notifying its listeners.
    ///
    /// Returns `Ok(false)` when nothing was queued because the text is too
    /// short or already cached.
    pub fn schedule(&self, user_id: &str, text: &str) -> BabbleResult<bool> {
        if self.core.too_short(text) || self.cached(text).is_some() {
            return Ok(false);
        }
        self.queue.enqueue(
            user_id,
            DetectionRequest {
                text: text.to_string(),
            },
        )?;
        Ok(true)
    }

    pub fn cached(&self, text: &str) -> Option<LanguageDetection> {
        self.core.cache.get(&text_cache_key(text))
    }

    pub fn cache(&self) -> &KeyedCache<String, LanguageDetection> {
        &self.core.cache
    }

    pub fn queue(&self) -> &DebouncedBatchProcessor<DetectionRequest> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use babble_core::{BabbleError, SupportedLanguage};
    use babble_llm::MockTextIntelligence;
    use babble_storage::CacheEvent;
    use babble_test_utils::{assertions, fixtures};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detector_with(config: &BabbleConfig) -> (Arc<MockTextIntelligence>, LanguageDetector) {
        let mock = Arc::new(MockTextIntelligence::new());
        let clock = fixtures::manual_clock();
        let cache = KeyedCache::new(clock.clone(), None);
        let detector = LanguageDetector::new(mock.clone(), cache, clock, config);
        (mock, detector)
    }

    fn detector() -> (Arc<MockTextIntelligence>, LanguageDetector) {
        detector_with(&BabbleConfig::default())
    }

    #[tokio::test]
    async fn test_short_text_skips_provider() {
        let (mock, detector) = detector();
        let detection = detector.detect("u1", " ok ").await.unwrap();
        assert_eq!(detection.language, None);
        assert_eq!(mock.calls().detect, 0);
        assert!(detector.cache().is_empty());
    }

    #[tokio::test]
    async fn test_normalised_text_shares_cache_entry() {
        let (mock, detector) = detector();
        let first = detector.detect("u1", "Hola amigo, gracias").await.unwrap();
        assert_eq!(first.language, Some(SupportedLanguage::Spanish));

        let second = detector.detect("u2", "  hola AMIGO, gracias ").await.unwrap();
        assert_eq!(second, first);
        assert_eq!(mock.calls().detect, 1);
    }

    #[tokio::test]
    async fn test_cache_misses_are_rate_limited_per_user() {
        let mut config = BabbleConfig::default();
        config.batch.rate_limit_ops = 1;
        config.batch.rate_limit_window_ms = 3_600_000;
        let (mock, detector) = detector_with(&config);

        detector.detect("u1", "bonjour merci").await.unwrap();
        // Cache hits cost nothing.
        detector.detect("u1", "bonjour merci").await.unwrap();

        let limited = detector.detect("u1", "hallo danke").await;
        assertions::assert_rate_limited(&limited, "u1");
        detector.detect("u2", "hallo danke").await.unwrap();
        assert_eq!(mock.calls().detect, 2);
    }

    #[tokio::test]
    async fn test_provider_failure_is_not_cached() {
        let (mock, detector) = detector();
        mock.fail_next(1);
        let err = detector.detect("u1", "ciao grazie").await.unwrap_err();
        assert!(matches!(err, BabbleError::Llm(_)));
        assert!(detector.cached("ciao grazie").is_none());

        let detection = detector.detect("u1", "ciao grazie").await.unwrap();
        assert_eq!(detection.language, Some(SupportedLanguage::Italian));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_detection_lands_in_cache() {
        let (mock, detector) = detector();
        let key = text_cache_key("obrigado, tudo bem");
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let _listener = detector.cache().subscribe(key, move |_, event| {
            if matches!(event, CacheEvent::Updated(_)) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert!(detector.schedule("u1", "obrigado, tudo bem").unwrap());
        assert!(detector.schedule("u1", "Obrigado, tudo bem").unwrap());
        assert!(detector.cached("obrigado, tudo bem").is_none());

        // Past the longest debounce delay.
        tokio::time::sleep(Duration::from_secs(5)).await;

        let report = detector.queue().last_report().unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.coalesced, 1);
        assert_eq!(mock.calls().detect, 1);
        assert_eq!(
            detector.cached("obrigado, tudo bem").unwrap().language,
            Some(SupportedLanguage::Portuguese)
        );
        assert_eq!(notified.load(Ordering::Relaxed), 1);

        assert!(!detector.schedule("u1", "obrigado, tudo bem").unwrap());
        assert!(!detector.schedule("u1", "ok").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_shares_rate_budget_with_detect() {
        let mut config = BabbleConfig::default();
        config.batch.rate_limit_ops = 1;
        config.batch.rate_limit_window_ms = 3_600_000;
        let (_mock, detector) = detector_with(&config);

        detector.schedule("u1", "guten morgen").unwrap();
        let limited = detector.detect("u1", "buenos días").await;
        assertions::assert_rate_limited(&limited, "u1");
    }
}

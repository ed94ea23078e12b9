//! Per-call timeout for text intelligence providers.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use babble_core::{BabbleResult, Extraction, IntelligenceConfig, LlmError};

use crate::{
    DetectedLanguage, ExtractionRequest, SummaryRequest, SummaryResponse, TextIntelligence,
    TranslatedText, TranslationRequest,
};

/// Wraps a provider so no call runs longer than `timeout`.
///
/// An elapsed call becomes [`LlmError::Timeout`]; failures are logged with
/// the provider id and passed through unchanged.
#[derive(Debug, Clone)]
pub struct TimeoutIntelligence<T> {
    inner: T,
    timeout: Duration,
}

impl<T: TextIntelligence> TimeoutIntelligence<T> {
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn from_config(inner: T, config: &IntelligenceConfig) -> Self {
        Self::new(inner, config.call_timeout())
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<R: Send>(
        &self,
        operation: &'static str,
        call: impl Future<Output = BabbleResult<R>> + Send,
    ) -> BabbleResult<R> {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                operation: operation.to_string(),
                after: self.timeout,
            }
            .into()),
        };
        if let Err(e) = &result {
            tracing::warn!(
                provider = self.inner.provider_id(),
                operation,
                error = %e,
                "Text intelligence call failed"
            );
        }
        result
    }
}

#[async_trait]
impl<T: TextIntelligence> TextIntelligence for TimeoutIntelligence<T> {
    async fn detect_language(&self, text: &str) -> BabbleResult<DetectedLanguage> {
        self.bounded("detect_language", self.inner.detect_language(text))
            .await
    }

    async fn translate_text(&self, request: &TranslationRequest) -> BabbleResult<TranslatedText> {
        self.bounded("translate_text", self.inner.translate_text(request))
            .await
    }

    async fn extract_structured_data(&self, request: &ExtractionRequest) -> BabbleResult<Vec<Extraction>> {
        self.bounded(
            "extract_structured_data",
            self.inner.extract_structured_data(request),
        )
        .await
    }

    async fn summarize_conversation(&self, request: &SummaryRequest) -> BabbleResult<SummaryResponse> {
        self.bounded(
            "summarize_conversation",
            self.inner.summarize_conversation(request),
        )
        .await
    }

    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }
}

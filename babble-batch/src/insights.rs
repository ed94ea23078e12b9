//! Conversation insights extraction queue.

use std::sync::Arc;

use async_trait::async_trait;
use babble_core::clock::Clock;
use babble_core::{BabbleResult, BatchConfig, ChatId, ConversationInsights, Message, MessageId};
use babble_llm::{ExtractionRequest, TextIntelligence};
use babble_storage::KeyedCache;

use crate::processor::{BatchHandler, BatchPayload, DebouncedBatchProcessor, QueueItem};

/// A message queued for structured extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsightRequest {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: String,
    /// Earlier texts of the chat, oldest first.
    pub context: Vec<String>,
}

impl InsightRequest {
    pub fn for_message(message: &Message) -> Self {
        Self {
            chat_id: message.chat_id.clone(),
            message_id: message.id.clone(),
            text: message.text.clone(),
            context: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }
}

impl BatchPayload for InsightRequest {
    fn text(&self) -> &str {
        &self.text
    }

    /// An edited message supersedes its earlier text in the same batch.
    fn dedupe_key(&self) -> Option<String> {
        Some(format!("{}:{}", self.chat_id, self.message_id))
    }
}

/// Batch handler that runs `extract_structured_data` on queued messages and
/// merges the results into per-chat insights.
pub struct InsightsProcessor {
    intelligence: Arc<dyn TextIntelligence>,
    insights: KeyedCache<ChatId, ConversationInsights>,
    clock: Arc<dyn Clock>,
}

impl InsightsProcessor {
    pub fn new(
        intelligence: Arc<dyn TextIntelligence>,
        insights: KeyedCache<ChatId, ConversationInsights>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            intelligence,
            insights,
            clock,
        }
    }

    /// Wrap this handler in a debounced, rate limited queue.
    pub fn into_queue(self, config: &BatchConfig) -> DebouncedBatchProcessor<InsightRequest> {
        let clock = Arc::clone(&self.clock);
        DebouncedBatchProcessor::from_config("insights", Arc::new(self), config, clock)
    }

    pub fn insights(&self) -> &KeyedCache<ChatId, ConversationInsights> {
        &self.insights
    }
}

#[async_trait]
impl BatchHandler<InsightRequest> for InsightsProcessor {
    async fn handle(&self, item: &QueueItem<InsightRequest>) -> BabbleResult<()> {
        let request = &item.payload;
        let extractions = self
            .intelligence
            .extract_structured_data(&ExtractionRequest {
                text: request.text.clone(),
                message_id: Some(request.message_id.clone()),
                kinds: Vec::new(),
                context: request.context.clone(),
            })
            .await?;

        let now = self.clock.now();
        let mut insights = self
            .insights
            .get(&request.chat_id)
            .unwrap_or_else(|| ConversationInsights::empty(request.chat_id.clone(), now));
        let found = extractions.len();
        insights.merge(extractions, now);
        self.insights.set(request.chat_id.clone(), insights);

        tracing::debug!(
            chat_id = %request.chat_id,
            message_id = %request.message_id,
            found,
            "Merged conversation insights"
        );
        Ok(())
    }
}

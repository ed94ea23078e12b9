//! Bounded, expiring per-conversation snapshots for offline reads.
//!
//! A snapshot holds the most recent messages of one chat plus the
//! translations of exactly those messages. Snapshots are JSON documents in a
//! [`LocalStore`] under `<key_prefix><chat_id>`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use babble_core::clock::{expiry_after, Clock};
use babble_core::{
    sort_chronologically, BabbleResult, ChatId, Message, MessageId, OfflineConfig, StorageError,
    Timestamp, TranslationResult, ValidationError,
};
use serde::{Deserialize, Serialize};

use crate::local::LocalStore;

/// What is persisted for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedConversationSnapshot {
    pub chat_id: ChatId,
    /// Chronological, at most `max_messages` long.
    pub messages: Vec<Message>,
    /// Keyed by message id; only ids present in `messages`.
    pub translations: HashMap<MessageId, TranslationResult>,
    pub cached_at: Timestamp,
    pub expires_at: Timestamp,
}

impl CachedConversationSnapshot {
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Offline snapshot cache over a local store.
pub struct OfflineMessageCache {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    config: OfflineConfig,
}

impl std::fmt::Debug for OfflineMessageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineMessageCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OfflineMessageCache {
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>, config: OfflineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    fn key_for(&self, chat_id: &str) -> String {
        format!("{}{}", self.config.key_prefix, chat_id)
    }

    /// Persist the most recent messages of a chat and their translations.
    ///
    /// Messages are ordered chronologically and truncated to the newest
    /// `max_messages`; translations of dropped messages are not stored.
    pub async fn save(
        &self,
        chat_id: &str,
        messages: &[Message],
        translations: &HashMap<MessageId, TranslationResult>,
    ) -> BabbleResult<CachedConversationSnapshot> {
        if chat_id.is_empty() {
            return Err(ValidationError::EmptyKey.into());
        }

        let mut retained = messages.to_vec();
        sort_chronologically(&mut retained);
        let overflow = retained.len().saturating_sub(self.config.max_messages);
        retained.drain(..overflow);

        let retained_ids: HashSet<&str> = retained.iter().map(|m| m.id.as_str()).collect();
        let translations: HashMap<MessageId, TranslationResult> = translations
            .iter()
            .filter(|(id, _)| retained_ids.contains(id.as_str()))
            .map(|(id, t)| (id.clone(), t.clone()))
            .collect();

        let now = self.clock.now();
        let snapshot = CachedConversationSnapshot {
            chat_id: chat_id.to_string(),
            messages: retained,
            translations,
            cached_at: now,
            expires_at: expiry_after(now, self.config.retention()),
        };

        let key = self.key_for(chat_id);
        let json = serde_json::to_string(&snapshot).map_err(|e| StorageError::Serialization {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set_item(&key, json).await?;

        tracing::debug!(
            chat_id,
            messages = snapshot.messages.len(),
            dropped = overflow,
            translations = snapshot.translations.len(),
            "Saved offline snapshot"
        );
        Ok(snapshot)
    }

    /// Load a chat's snapshot.
    ///
    /// Expired and unreadable snapshots are removed and reported absent.
    /// Store failures are logged and reported absent.
    pub async fn load(&self, chat_id: &str) -> Option<CachedConversationSnapshot> {
        let key = self.key_for(chat_id);
        let raw = match self.store.get_item(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "Offline snapshot read failed");
                return None;
            }
        };

        let snapshot: CachedConversationSnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "Discarding unreadable offline snapshot");
                self.remove_quietly(&key).await;
                return None;
            }
        };

        if snapshot.is_expired_at(self.clock.now()) {
            tracing::debug!(chat_id, expires_at = %snapshot.expires_at, "Offline snapshot expired");
            self.remove_quietly(&key).await;
            return None;
        }

        Some(snapshot)
    }

    /// Load the snapshot and merge it under `fresh` messages.
    pub async fn load_merged(&self, chat_id: &str, fresh: &[Message]) -> Vec<Message> {
        match self.load(chat_id).await {
            Some(snapshot) => Self::merge(fresh, &snapshot.messages),
            None => {
                let mut messages = fresh.to_vec();
                sort_chronologically(&mut messages);
                messages
            }
        }
    }

    /// Remove one chat's snapshot.
    pub async fn clear(&self, chat_id: &str) -> BabbleResult<()> {
        self.store.remove_item(&self.key_for(chat_id)).await
    }

    /// Remove every snapshot. Other keys in the store are left alone.
    pub async fn clear_all(&self) -> BabbleResult<usize> {
        let keys = self.snapshot_keys().await?;
        self.store.multi_remove(&keys).await?;
        tracing::debug!(removed = keys.len(), "Cleared offline snapshots");
        Ok(keys.len())
    }

    /// Remove every expired or unreadable snapshot.
    pub async fn purge_expired(&self) -> BabbleResult<usize> {
        let now = self.clock.now();
        let mut stale = Vec::new();
        for key in self.snapshot_keys().await? {
            let Some(raw) = self.store.get_item(&key).await? else {
                continue;
            };
            let keep = serde_json::from_str::<CachedConversationSnapshot>(&raw)
                .map(|snapshot| !snapshot.is_expired_at(now))
                .unwrap_or(false);
            if !keep {
                stale.push(key);
            }
        }
        if !stale.is_empty() {
            self.store.multi_remove(&stale).await?;
            tracing::debug!(purged = stale.len(), "Purged expired offline snapshots");
        }
        Ok(stale.len())
    }

    /// Reconcile live messages with cached ones.
    ///
    /// Every fresh message is kept. Cached messages whose id is missing from
    /// `fresh` are added back, so nothing the live source temporarily omits
    /// is lost. The result is chronological with ids breaking ties.
    pub fn merge(fresh: &[Message], cached: &[Message]) -> Vec<Message> {
        let mut seen: HashSet<&str> = fresh.iter().map(|m| m.id.as_str()).collect();
        let mut merged = fresh.to_vec();
        for message in cached {
            if seen.insert(message.id.as_str()) {
                merged.push(message.clone());
            }
        }
        sort_chronologically(&mut merged);
        merged
    }

    async fn snapshot_keys(&self) -> BabbleResult<Vec<String>> {
        Ok(self
            .store
            .get_all_keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(&self.config.key_prefix))
            .collect())
    }

    async fn remove_quietly(&self, key: &str) {
        if let Err(e) = self.store.remove_item(key).await {
            tracing::warn!(key, error = %e, "Failed to remove offline snapshot");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Typed descriptions of the live queries the client subscribes to.

use babble_core::{ChatId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A live query against the reactive data source.
///
/// Documents live at slash-separated paths:
///
/// - `users/{uid}`: user profiles
/// - `chats/{chat_id}`: chat documents with a `participants` array
/// - `chats/{chat_id}/messages/{message_id}`: messages with a `timestamp`
/// - `presence/{uid}`: online state
/// - `insights/{chat_id}`: extracted conversation insights
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryDescriptor {
    /// Chats the user participates in.
    UserChats { user_id: UserId },
    /// Every user profile.
    AllUserProfiles,
    /// One user's presence document.
    Presence { user_id: UserId },
    /// Messages of one chat in timestamp order, optionally only the newest `limit`.
    ChatMessages { chat_id: ChatId, limit: Option<usize> },
    /// Insights document of one chat.
    ConversationInsights { chat_id: ChatId },
}

impl QueryDescriptor {
    /// Stable key used for subscription sharing and cache entries.
    pub fn cache_key(&self) -> String {
        match self {
            Self::UserChats { user_id } => format!("chats:user:{user_id}"),
            Self::AllUserProfiles => "users:all".to_string(),
            Self::Presence { user_id } => format!("presence:{user_id}"),
            Self::ChatMessages { chat_id, limit } => match limit {
                Some(limit) => format!("messages:{chat_id}:{limit}"),
                None => format!("messages:{chat_id}:all"),
            },
            Self::ConversationInsights { chat_id } => format!("insights:{chat_id}"),
        }
    }

    /// Whether a write to `path` can change this query's result.
    pub fn watches(&self, path: &str) -> bool {
        let segments: Vec<&str> = path.split('/').collect();
        match (self, segments.as_slice()) {
            (Self::UserChats { .. }, ["chats", _]) => true,
            (Self::AllUserProfiles, ["users", _]) => true,
            (Self::Presence { user_id }, ["presence", uid]) => *uid == user_id.as_str(),
            (Self::ChatMessages { chat_id, .. }, ["chats", chat, "messages", _]) => {
                *chat == chat_id.as_str()
            }
            (Self::ConversationInsights { chat_id }, ["insights", chat]) => *chat == chat_id.as_str(),
            _ => false,
        }
    }

    /// Evaluate the query over `(path, document)` pairs.
    ///
    /// Collection queries yield an array of documents, each with an `id`
    /// field holding the last path segment. Single-document queries yield
    /// the document or `null`.
    pub fn evaluate<'a, I>(&self, documents: I) -> JsonValue
    where
        I: IntoIterator<Item = (&'a str, &'a JsonValue)>,
    {
        match self {
            Self::Presence { user_id } => single(documents, &format!("presence/{user_id}")),
            Self::ConversationInsights { chat_id } => {
                single(documents, &format!("insights/{chat_id}"))
            }
            Self::UserChats { user_id } => {
                let chats = documents
                    .into_iter()
                    .filter(|(path, _)| self.watches(path))
                    .filter(|(_, doc)| {
                        doc.get("participants")
                            .and_then(JsonValue::as_array)
                            .is_some_and(|p| p.iter().any(|v| v.as_str() == Some(user_id.as_str())))
                    })
                    .map(|(path, doc)| with_id(path, doc))
                    .collect();
                JsonValue::Array(chats)
            }
            Self::AllUserProfiles => JsonValue::Array(
                documents
                    .into_iter()
                    .filter(|(path, _)| self.watches(path))
                    .map(|(path, doc)| with_id(path, doc))
                    .collect(),
            ),
            Self::ChatMessages { limit, .. } => {
                let mut messages: Vec<JsonValue> = documents
                    .into_iter()
                    .filter(|(path, _)| self.watches(path))
                    .map(|(path, doc)| with_id(path, doc))
                    .collect();
                messages.sort_by(|a, b| {
                    let ts = |v: &JsonValue| v.get("timestamp").and_then(JsonValue::as_str).map(str::to_owned);
                    let id = |v: &JsonValue| v.get("id").and_then(JsonValue::as_str).map(str::to_owned);
                    ts(a).cmp(&ts(b)).then_with(|| id(a).cmp(&id(b)))
                });
                if let Some(limit) = limit {
                    let overflow = messages.len().saturating_sub(*limit);
                    messages.drain(..overflow);
                }
                JsonValue::Array(messages)
            }
        }
    }
}

fn single<'a, I>(documents: I, wanted: &str) -> JsonValue
where
    I: IntoIterator<Item = (&'a str, &'a JsonValue)>,
{
    documents
        .into_iter()
        .find(|(path, _)| *path == wanted)
        .map(|(path, doc)| with_id(path, doc))
        .unwrap_or(JsonValue::Null)
}

fn with_id(path: &str, doc: &JsonValue) -> JsonValue {
    let id = path.rsplit('/').next().unwrap_or(path);
    match doc {
        JsonValue::Object(fields) => {
            let mut fields = fields.clone();
            fields
                .entry("id")
                .or_insert_with(|| JsonValue::String(id.to_string()));
            JsonValue::Object(fields)
        }
        other => other.clone(),
    }
}

//! Error types for Babble operations

use std::time::Duration;
use thiserror::Error;

/// Remote store or API failure that may succeed on retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote {operation} unavailable: {reason}")]
    Unavailable { operation: String, reason: String },

    #[error("Remote {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Remote {operation} rejected: {reason}")]
    Rejected { operation: String, reason: String },
}

impl RemoteError {
    pub fn unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

/// Caller supplied something the API boundary refuses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unsupported language: {language}")]
    UnsupportedLanguage { language: String },

    #[error("Key must not be empty")]
    EmptyKey,

    #[error("Invalid payload for {field}: {reason}")]
    InvalidPayload { field: String, reason: String },

    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },
}

/// An actor exceeded its operation budget.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Rate limit exceeded for {actor_id}, retry after {retry_after:?}")]
pub struct RateLimitExceeded {
    pub actor_id: String,
    pub retry_after: Duration,
}

/// Live subscription errors, delivered to subscribers as values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Subscription setup failed for {key}: {reason}")]
    SetupFailed { key: String, reason: String },

    #[error("Subscription source error for {key}: {reason}")]
    Source { key: String, reason: String },

    #[error("Subscription manager is shut down")]
    Closed,
}

/// Text intelligence (detection, translation, extraction) errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("Text intelligence {operation} unavailable: {reason}")]
    Unavailable { operation: String, reason: String },

    #[error("Text intelligence {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Invalid response from {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },
}

/// Local persistence errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("IO error on {key}: {reason}")]
    Io { key: String, reason: String },

    #[error("Storage backend error: {reason}")]
    Backend { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Master error type for all Babble errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BabbleError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    RateLimited(#[from] RateLimitExceeded),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{component} is shut down")]
    ShutDown { component: String },
}

impl BabbleError {
    pub fn shut_down(component: impl Into<String>) -> Self {
        Self::ShutDown {
            component: component.into(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Remote(RemoteError::Rejected { .. }) => false,
            Self::Remote(_) => true,
            Self::Llm(LlmError::InvalidResponse { .. }) => false,
            Self::Llm(_) => true,
            Self::RateLimited(_) => true,
            Self::Storage(StorageError::Io { .. }) => true,
            _ => false,
        }
    }

    /// Whether this error is a rate-limit rejection the UI should present as
    /// "slow down" rather than a generic failure.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// Result type alias for Babble operations.
pub type BabbleResult<T> = Result<T, BabbleError>;

// =============================================================================
// TESTS
// =============================================================================

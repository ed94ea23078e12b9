//! Debounce delay policies.

use std::time::Duration;

use babble_core::DebounceConfig;

/// How long to wait after the latest enqueue before flushing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebouncePolicy {
    /// Same delay for every payload.
    Fixed(Duration),
    /// Delay chosen from the payload's text length in characters: below
    /// `short_text_chars` waits `short_delay_ms`, below `medium_text_chars`
    /// waits `medium_delay_ms`, anything longer waits `long_delay_ms`.
    TextLength(DebounceConfig),
}

impl Default for DebouncePolicy {
    fn default() -> Self {
        Self::TextLength(DebounceConfig::default())
    }
}

impl DebouncePolicy {
    pub fn delay_for(&self, text: &str) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::TextLength(config) => {
                let chars = text.trim().chars().count();
                let millis = if chars < config.short_text_chars {
                    config.short_delay_ms
                } else if chars < config.medium_text_chars {
                    config.medium_delay_ms
                } else {
                    config.long_delay_ms
                };
                Duration::from_millis(millis)
            }
        }
    }
}

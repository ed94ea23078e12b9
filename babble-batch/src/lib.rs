//! Babble Batch - Debounced Text Analysis Queue
//!
//! Text-analysis work (detection, extraction) is expensive and bursty while a
//! user types. [`DebouncedBatchProcessor`] collects it until the burst
//! settles, rate limits each actor through [`ActorRateLimiter`], collapses
//! near-duplicate requests and hands the batch to a [`BatchHandler`].

pub mod debounce;
pub mod insights;
pub mod processor;
pub mod rate_limit;

pub use debounce::DebouncePolicy;
pub use insights::{InsightRequest, InsightsProcessor};
pub use processor::{
    BatchHandler, BatchPayload, BatchReport, DebouncedBatchProcessor, ProcessorMetricsSnapshot,
    ProcessorSettings, QueueItem,
};
pub use rate_limit::ActorRateLimiter;

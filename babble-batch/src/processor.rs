//! Debounced batch queue.
//!
//! Items accumulate until no enqueue has happened for the debounce delay of
//! the latest payload. The whole queue is then drained atomically and handed
//! to a [`BatchHandler`] one item at a time, each call bounded by a
//! per-item timeout. Items enqueued while a batch is being handled start a
//! fresh batch; batches are handled one after another in drain order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use babble_core::clock::Clock;
use babble_core::{BabbleError, BabbleResult, BatchConfig, Timestamp};
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::debounce::DebouncePolicy;
use crate::rate_limit::ActorRateLimiter;

/// Something that can be queued for batch processing.
pub trait BatchPayload: Clone + Send + Sync + 'static {
    /// Text used to pick the debounce delay.
    fn text(&self) -> &str;

    /// Items sharing a key inside one batch collapse to the latest one.
    /// `None` never coalesces.
    fn dedupe_key(&self) -> Option<String> {
        None
    }
}

/// A queued payload.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem<P> {
    pub payload: P,
    pub actor_id: String,
    pub enqueued_at: Timestamp,
}

/// Handles one drained item.
#[async_trait]
pub trait BatchHandler<P: BatchPayload>: Send + Sync {
    async fn handle(&self, item: &QueueItem<P>) -> BabbleResult<()>;
}

/// Outcome of one flushed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// UUIDv7, so batch ids sort by creation time.
    pub batch_id: Uuid,
    pub processed: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Items dropped because a later item had the same dedupe key.
    pub coalesced: usize,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

impl BatchReport {
    /// Items handed to the handler.
    pub fn attempted(&self) -> usize {
        self.processed + self.failed + self.timed_out
    }
}

/// Tuning for a [`DebouncedBatchProcessor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSettings {
    /// Used in logs and shutdown errors.
    pub name: String,
    pub policy: DebouncePolicy,
    pub item_timeout: Duration,
    pub coalesce: bool,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self::from_config("batch", &BatchConfig::default())
    }
}

impl ProcessorSettings {
    pub fn from_config(name: impl Into<String>, config: &BatchConfig) -> Self {
        Self {
            name: name.into(),
            policy: DebouncePolicy::TextLength(config.debounce.clone()),
            item_timeout: config.item_timeout(),
            coalesce: config.coalesce,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
struct ProcessorMetrics {
    batches: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    coalesced: AtomicU64,
    rejected: AtomicU64,
}

/// Lifetime counters of a processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorMetricsSnapshot {
    pub batches: u64,
    pub processed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub coalesced: u64,
    /// Enqueues refused by the rate limiter.
    pub rejected: u64,
}

impl ProcessorMetrics {
    fn record(&self, report: &BatchReport) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(report.processed as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        self.timed_out.fetch_add(report.timed_out as u64, Ordering::Relaxed);
        self.coalesced.fetch_add(report.coalesced as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProcessorMetricsSnapshot {
        ProcessorMetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// PROCESSOR
// ============================================================================

struct QueueState<P> {
    items: Vec<QueueItem<P>>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is re-armed or cancelled; a timer that
    /// wakes with a stale generation does nothing.
    generation: u64,
    closed: bool,
}

struct ProcessorInner<P: BatchPayload> {
    settings: ProcessorSettings,
    handler: Arc<dyn BatchHandler<P>>,
    limiter: ActorRateLimiter,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState<P>>,
    flushing: tokio::sync::Mutex<()>,
    last_report: Mutex<Option<BatchReport>>,
    metrics: ProcessorMetrics,
}

impl<P: BatchPayload> ProcessorInner<P> {
    fn state(&self) -> MutexGuard<'_, QueueState<P>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn shut_down_error(&self) -> BabbleError {
        BabbleError::shut_down(self.settings.name.clone())
    }

    /// Drain the queue and cancel any armed timer.
    fn take_all(&self, close: bool) -> Vec<QueueItem<P>> {
        let mut state = self.state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation = state.generation.wrapping_add(1);
        state.closed |= close;
        std::mem::take(&mut state.items)
    }

    async fn fire(&self, generation: u64) {
        let items = {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            state.timer = None;
            std::mem::take(&mut state.items)
        };
        self.process(items).await;
    }

    async fn process(&self, items: Vec<QueueItem<P>>) -> Option<BatchReport> {
        if items.is_empty() {
            return None;
        }
        let _flushing = self.flushing.lock().await;

        let batch_id = Uuid::now_v7();
        let started_at = self.clock.now();
        let received = items.len();
        let items = if self.settings.coalesce {
            coalesce(items)
        } else {
            items
        };
        let mut report = BatchReport {
            batch_id,
            processed: 0,
            failed: 0,
            timed_out: 0,
            coalesced: received - items.len(),
            started_at,
            finished_at: started_at,
        };

        for item in &items {
            match tokio::time::timeout(self.settings.item_timeout, self.handler.handle(item)).await {
                Ok(Ok(())) => report.processed += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(
                        processor = %self.settings.name,
                        batch_id = %batch_id,
                        actor_id = %item.actor_id,
                        error = %e,
                        "Batch item failed"
                    );
                }
                Err(_) => {
                    report.timed_out += 1;
                    tracing::warn!(
                        processor = %self.settings.name,
                        batch_id = %batch_id,
                        actor_id = %item.actor_id,
                        timeout_ms = self.settings.item_timeout.as_millis() as u64,
                        "Batch item timed out"
                    );
                }
            }
        }

        report.finished_at = self.clock.now();
        self.metrics.record(&report);
        self.limiter.sweep_idle();
        tracing::debug!(
            processor = %self.settings.name,
            batch_id = %batch_id,
            processed = report.processed,
            failed = report.failed,
            timed_out = report.timed_out,
            coalesced = report.coalesced,
            "Batch flushed"
        );
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        Some(report)
    }
}

impl<P: BatchPayload> Drop for ProcessorInner<P> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

/// Keep the latest item per dedupe key, preserving the order of survivors.
fn coalesce<P: BatchPayload>(items: Vec<QueueItem<P>>) -> Vec<QueueItem<P>> {
    let keys: Vec<Option<String>> = items.iter().map(|item| item.payload.dedupe_key()).collect();
    let mut latest: HashMap<&str, usize> = HashMap::new();
    for (index, key) in keys.iter().enumerate() {
        if let Some(key) = key {
            latest.insert(key.as_str(), index);
        }
    }
    items
        .into_iter()
        .enumerate()
        .filter(|(index, _)| match &keys[*index] {
            Some(key) => latest.get(key.as_str()) == Some(index),
            None => true,
        })
        .map(|(_, item)| item)
        .collect()
}

/// Debounced, per-actor rate limited batch queue.
///
/// Owns a single timer task, aborted and respawned on every enqueue. The
/// timer holds only a weak reference, so dropping the last processor handle
/// cancels pending work. Must be used from within a Tokio runtime.
pub struct DebouncedBatchProcessor<P: BatchPayload> {
    inner: Arc<ProcessorInner<P>>,
}

impl<P: BatchPayload> Clone for DebouncedBatchProcessor<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: BatchPayload> std::fmt::Debug for DebouncedBatchProcessor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebouncedBatchProcessor")
            .field("name", &self.inner.settings.name)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<P: BatchPayload> DebouncedBatchProcessor<P> {
    pub fn new(
        handler: Arc<dyn BatchHandler<P>>,
        limiter: ActorRateLimiter,
        settings: ProcessorSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                settings,
                handler,
                limiter,
                clock,
                state: Mutex::new(QueueState {
                    items: Vec::new(),
                    timer: None,
                    generation: 0,
                    closed: false,
                }),
                flushing: tokio::sync::Mutex::new(()),
                last_report: Mutex::new(None),
                metrics: ProcessorMetrics::default(),
            }),
        }
    }

    pub fn from_config(
        name: impl Into<String>,
        handler: Arc<dyn BatchHandler<P>>,
        config: &BatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            handler,
            ActorRateLimiter::from_config(config),
            ProcessorSettings::from_config(name, config),
            clock,
        )
    }

    /// Queue `payload` on behalf of `actor_id` and re-arm the flush timer.
    ///
    /// Fails synchronously with [`BabbleError::RateLimited`] when the actor
    /// is over budget, or [`BabbleError::ShutDown`] after
    /// [`shutdown`](Self::shutdown).
    pub fn enqueue(&self, actor_id: &str, payload: P) -> BabbleResult<()> {
        let inner = &self.inner;
        if inner.state().closed {
            return Err(inner.shut_down_error());
        }
        if let Err(limited) = inner.limiter.check(actor_id) {
            inner.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(limited.into());
        }

        let delay = inner.settings.policy.delay_for(payload.text());
        let item = QueueItem {
            payload,
            actor_id: actor_id.to_string(),
            enqueued_at: inner.clock.now(),
        };

        let mut state = inner.state();
        if state.closed {
            return Err(inner.shut_down_error());
        }
        state.items.push(item);
        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;
        if let Some(previous) = state.timer.take() {
            previous.abort();
        }
        let weak = Arc::downgrade(&self.inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(generation).await;
            }
        }));
        tracing::trace!(
            processor = %inner.settings.name,
            actor_id,
            pending = state.items.len(),
            delay_ms = delay.as_millis() as u64,
            "Enqueued batch item"
        );
        Ok(())
    }

    /// Flush immediately, cancelling the armed timer. `None` when the queue
    /// was empty.
    pub async fn flush_now(&self) -> Option<BatchReport> {
        let items = self.inner.take_all(false);
        self.inner.process(items).await
    }

    /// Refuse further enqueues and flush whatever is pending.
    pub async fn shutdown(&self) -> Option<BatchReport> {
        let items = self.inner.take_all(true);
        tracing::info!(
            processor = %self.inner.settings.name,
            pending = items.len(),
            "Batch processor shutting down"
        );
        self.inner.process(items).await
    }

    pub fn pending(&self) -> usize {
        self.inner.state().items.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    pub fn last_report(&self) -> Option<BatchReport> {
        self.inner.last_report.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn metrics(&self) -> ProcessorMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn rate_limiter(&self) -> &ActorRateLimiter {
        &self.inner.limiter
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.inner.settings
    }
}

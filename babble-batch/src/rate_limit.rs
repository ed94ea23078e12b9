//! Per-actor rate limiting.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use babble_core::{BatchConfig, RateLimitExceeded};
use dashmap::DashMap;
use governor::{clock::DefaultClock, Quota, RateLimiter};

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    DefaultClock,
>;

struct ActorBucket {
    limiter: DirectRateLimiter,
    last_used: Mutex<Instant>,
}

impl ActorBucket {
    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

/// Allows each actor `ops` operations per `window`.
///
/// Every actor gets its own bucket, so one chatty user never throttles
/// another. Buckets are created on first use. A bucket idle for a whole
/// window has refilled completely, so [`sweep_idle`](Self::sweep_idle) can
/// drop it without changing any actor's budget.
#[derive(Clone)]
pub struct ActorRateLimiter {
    quota: Quota,
    ops: NonZeroU32,
    window: Duration,
    limiters: Arc<DashMap<String, Arc<ActorBucket>>>,
}

impl std::fmt::Debug for ActorRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRateLimiter")
            .field("ops", &self.ops)
            .field("window", &self.window)
            .field("actors", &self.limiters.len())
            .finish()
    }
}

impl ActorRateLimiter {
    /// A limiter allowing `ops` operations per `window` and actor.
    ///
    /// The full budget is available as a burst; it refills evenly across the
    /// window. Zero `ops` is treated as one.
    pub fn new(ops: u32, window: Duration) -> Self {
        let ops = NonZeroU32::new(ops).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(window / ops.get())
            .unwrap_or_else(|| Quota::per_second(ops))
            .allow_burst(ops);
        Self {
            quota,
            ops,
            window,
            limiters: Arc::new(DashMap::new()),
        }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.rate_limit_ops, config.rate_limit_window())
    }

    fn bucket_for(&self, actor_id: &str) -> Arc<ActorBucket> {
        if let Some(existing) = self.limiters.get(actor_id) {
            return Arc::clone(existing.value());
        }
        self.limiters
            .entry(actor_id.to_string())
            .or_insert_with(|| {
                Arc::new(ActorBucket {
                    limiter: RateLimiter::direct(self.quota),
                    last_used: Mutex::new(Instant::now()),
                })
            })
            .clone()
    }

    /// Spend one operation from the actor's budget.
    pub fn check(&self, actor_id: &str) -> Result<(), RateLimitExceeded> {
        let bucket = self.bucket_for(actor_id);
        bucket.touch();
        match bucket.limiter.check() {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let retry_after =
                    not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
                tracing::debug!(actor_id, retry_after_ms = retry_after.as_millis() as u64, "Actor rate limited");
                Err(RateLimitExceeded {
                    actor_id: actor_id.to_string(),
                    retry_after,
                })
            }
        }
    }

    pub fn ops(&self) -> u32 {
        self.ops.get()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of actors with a live bucket.
    pub fn tracked_actors(&self) -> usize {
        self.limiters.len()
    }

    /// Drop an actor's bucket, restoring its full budget.
    pub fn forget(&self, actor_id: &str) {
        self.limiters.remove(actor_id);
    }

    pub fn clear(&self) {
        self.limiters.clear();
    }

    /// Drop buckets unused for at least `window`. Returns how many went.
    pub fn sweep_idle(&self) -> usize {
        let before = self.limiters.len();
        self.limiters
            .retain(|_, bucket| bucket.idle_for() < self.window);
        let swept = before.saturating_sub(self.limiters.len());
        if swept > 0 {
            tracing::debug!(swept, remaining = self.limiters.len(), "Swept idle rate limit buckets");
        }
        swept
    }
}

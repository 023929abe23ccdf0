// src/rate_limit/limiter.rs

use crate::config::RateLimitConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterKind {
    /// Permits accumulate once per interval; each admitted request spends one.
    TokenBucket,
    /// Each admitted request adds load; one unit drains per interval.
    LeakyBucket,
}

/// A request was turned away; retry after `retry_after_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub retry_after_secs: u64,
}

/// Bounded counter shared between admission checks and the periodic ticker.
#[derive(Debug)]
struct Bucket {
    kind: LimiterKind,
    capacity: u64,
    level: AtomicU64,
}

impl Bucket {
    fn tick(&self) -> bool {
        let capacity = self.capacity;
        let update = match self.kind {
            LimiterKind::TokenBucket => self
                .level
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < capacity).then(|| n + 1)
                }),
            LimiterKind::LeakyBucket => self
                .level
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n > 0).then(|| n - 1)
                }),
        };
        update.is_ok()
    }

    fn try_admit(&self) -> bool {
        let capacity = self.capacity;
        let update = match self.kind {
            LimiterKind::TokenBucket => self
                .level
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n > 0).then(|| n - 1)
                }),
            LimiterKind::LeakyBucket => self
                .level
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < capacity).then(|| n + 1)
                }),
        };
        update.is_ok()
    }
}

struct Ticker {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Per-backend admission gate with its own refill/drain task.
///
/// The limiter starts idle; [`RateLimiter::start`] spawns the periodic task
/// on the current tokio runtime and [`RateLimiter::shutdown`] (or dropping the
/// limiter) stops it.
pub struct RateLimiter {
    bucket: Arc<Bucket>,
    interval: Duration,
    ticker: Mutex<Option<Ticker>>,
}

impl RateLimiter {
    pub fn new(kind: LimiterKind, interval: Duration, capacity: u64) -> Self {
        Self {
            bucket: Arc::new(Bucket {
                kind,
                capacity,
                level: AtomicU64::new(0),
            }),
            interval,
            ticker: Mutex::new(None),
        }
    }

    pub fn token_bucket(interval: Duration, max_tokens: u64) -> Self {
        Self::new(LimiterKind::TokenBucket, interval, max_tokens)
    }

    pub fn leaky_bucket(interval: Duration, max_capacity: u64) -> Self {
        Self::new(LimiterKind::LeakyBucket, interval, max_capacity)
    }

    /// Build the limiter described by a backend's `rate_limit` entry.
    /// `None` for unrecognized limiter types.
    pub fn from_config(config: &RateLimitConfig) -> Option<Self> {
        match *config {
            RateLimitConfig::TokenBucket {
                generation_time_ms,
                max_token,
            } => Some(Self::token_bucket(
                Duration::from_millis(generation_time_ms),
                max_token,
            )),
            RateLimitConfig::LeakyBucket {
                leaky_rate_ms,
                max_capacity,
            } => Some(Self::leaky_bucket(
                Duration::from_millis(leaky_rate_ms),
                max_capacity,
            )),
            RateLimitConfig::Unrecognized => None,
        }
    }

    pub fn kind(&self) -> LimiterKind {
        self.bucket.kind
    }

    pub fn capacity(&self) -> u64 {
        self.bucket.capacity
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Current counter: available tokens, or queued load for a leaky bucket.
    pub fn level(&self) -> u64 {
        self.bucket.level.load(Ordering::Acquire)
    }

    /// Whole seconds advertised in `Retry-After`. Sub-second intervals
    /// truncate to zero.
    pub fn retry_after_secs(&self) -> u64 {
        self.interval.as_secs()
    }

    /// Admission check. On success the counter has already been adjusted.
    pub fn admit(&self) -> Result<(), Rejected> {
        if self.bucket.try_admit() {
            Ok(())
        } else {
            Err(Rejected {
                retry_after_secs: self.retry_after_secs(),
            })
        }
    }

    /// One refill (token bucket) or drain (leaky bucket) step. Returns
    /// whether the counter moved.
    pub fn tick(&self) -> bool {
        self.bucket.tick()
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Spawn the periodic task. Calling it on a running limiter is a no-op.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let bucket = self.bucket.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            // First adjustment happens one full period after start.
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        bucket.tick();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(kind = ?bucket.kind, "rate limiter ticker stopped");
                            break;
                        }
                    }
                }
            }
        });

        debug!(
            kind = ?self.bucket.kind,
            capacity = self.bucket.capacity,
            interval = ?self.interval,
            "rate limiter started"
        );

        *ticker = Some(Ticker {
            handle,
            shutdown_tx,
        });
    }

    /// Stop the periodic task and wait for it to exit.
    pub async fn shutdown(&self) {
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(ticker) = ticker {
            let _ = ticker.shutdown_tx.send(true);
            let _ = ticker.handle.await;
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        let ticker = self
            .ticker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = ticker {
            ticker.handle.abort();
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("kind", &self.bucket.kind)
            .field("capacity", &self.bucket.capacity)
            .field("level", &self.level())
            .field("interval", &self.interval)
            .finish()
    }
}

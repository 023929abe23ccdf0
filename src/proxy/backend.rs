// src/proxy/backend.rs
use crate::rate_limit::RateLimiter;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use url::Url;

#[derive(Debug, Default)]
struct ResponseStats {
    total_requests: u64,
    accumulated_response_time_ms: u64,
    mean_response_time_ms: u64,
    last_completed_at: Option<DateTime<Utc>>,
}

/// One upstream target and its live load statistics.
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub url: Url,
    /// Capacity hint only; admission is never refused on it.
    pub max_connections: usize,

    // Runtime state
    active_connections: AtomicUsize,
    stats: Mutex<ResponseStats>,
    // Mirrors `stats.mean_response_time_ms` so selection can scan lock-free.
    mean_response_time_ms: AtomicU64,
    rate_limiter: Option<RateLimiter>,
}

impl Backend {
    pub fn new(name: impl Into<String>, url: Url, max_connections: usize) -> Self {
        Self {
            name: name.into(),
            url,
            max_connections,
            active_connections: AtomicUsize::new(0),
            stats: Mutex::new(ResponseStats::default()),
            mean_response_time_ms: AtomicU64::new(0),
            rate_limiter: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturates at zero so an unbalanced call can never wrap the counter.
    pub fn decrement_connections(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Count the connection for as long as the returned guard lives.
    pub fn connection_guard(self: &Arc<Self>) -> ConnectionGuard {
        self.increment_connections();
        ConnectionGuard {
            backend: self.clone(),
        }
    }

    /// Count a completed request that carried no latency sample.
    pub fn increment_total(&self) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.total_requests += 1;
        stats.last_completed_at = Some(Utc::now());
    }

    /// Fold one observed latency into the running mean.
    pub fn record_response_time(&self, elapsed_ms: u64) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.total_requests += 1;
        stats.accumulated_response_time_ms += elapsed_ms;
        stats.mean_response_time_ms = stats.accumulated_response_time_ms / stats.total_requests;
        stats.last_completed_at = Some(Utc::now());
        self.mean_response_time_ms
            .store(stats.mean_response_time_ms, Ordering::Release);
    }

    pub fn mean_response_time_ms(&self) -> u64 {
        self.mean_response_time_ms.load(Ordering::Acquire)
    }

    pub fn total_requests(&self) -> u64 {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_requests
    }

    pub fn stats(&self) -> BackendStats {
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        BackendStats {
            name: self.name.clone(),
            target: self.url.to_string(),
            active_connections: self.active_connections(),
            max_connections: self.max_connections,
            total_requests: stats.total_requests,
            accumulated_response_time_ms: stats.accumulated_response_time_ms,
            mean_response_time_ms: stats.mean_response_time_ms,
            rate_limited: self.rate_limiter.is_some(),
            rate_limiter_level: self.rate_limiter.as_ref().map(RateLimiter::level),
            last_completed_at: stats.last_completed_at,
        }
    }
}

/// Point-in-time view of a backend, served by the admin `/stats` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub name: String,
    pub target: String,
    pub active_connections: usize,
    pub max_connections: usize,
    pub total_requests: u64,
    pub accumulated_response_time_ms: u64,
    pub mean_response_time_ms: u64,
    pub rate_limited: bool,
    pub rate_limiter_level: Option<u64>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// Holds one slot in `active_connections`; released on drop, whatever path
/// the request took.
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl Deref for ConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.decrement_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str) -> Arc<Backend> {
        Arc::new(Backend::new(
            name,
            Url::parse("http://127.0.0.1:3001").unwrap(),
            1000,
        ))
    }

    #[test]
    fn fresh_backend_has_zero_stats() {
        let b = backend("a");
        assert_eq!(b.active_connections(), 0);
        assert_eq!(b.mean_response_time_ms(), 0);
        assert_eq!(b.total_requests(), 0);
        assert!(b.stats().last_completed_at.is_none());
    }

    #[test]
    fn guard_releases_connection_on_drop() {
        let b = backend("a");
        {
            let _first = b.connection_guard();
            let second = b.connection_guard();
            assert_eq!(b.active_connections(), 2);
            drop(second);
            assert_eq!(b.active_connections(), 1);
        }
        assert_eq!(b.active_connections(), 0);
    }

    #[test]
    fn decrement_never_goes_negative() {
        let b = backend("a");
        b.decrement_connections();
        assert_eq!(b.active_connections(), 0);
    }

    #[test]
    fn mean_is_floor_average() {
        let b = backend("a");
        b.record_response_time(100);
        assert_eq!(b.mean_response_time_ms(), 100);
        b.record_response_time(201);
        assert_eq!(b.mean_response_time_ms(), 150);
        b.record_response_time(0);
        assert_eq!(b.mean_response_time_ms(), 100);

        let stats = b.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.accumulated_response_time_ms, 301);
        assert!(stats.last_completed_at.is_some());
    }

    #[test]
    fn increment_total_leaves_latency_alone() {
        let b = backend("a");
        b.record_response_time(40);
        b.increment_total();
        assert_eq!(b.total_requests(), 2);
        assert_eq!(b.mean_response_time_ms(), 40);
    }

    #[test]
    fn concurrent_samples_lose_no_updates() {
        let b = backend("a");
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let b = b.clone();
                std::thread::spawn(move || {
                    for i in 0..250u64 {
                        b.record_response_time(t * 10 + i % 7);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let expected_sum: u64 = (0..8u64)
            .flat_map(|t| (0..250u64).map(move |i| t * 10 + i % 7))
            .sum();
        let stats = b.stats();
        assert_eq!(stats.total_requests, 2000);
        assert_eq!(stats.accumulated_response_time_ms, expected_sum);
        assert_eq!(stats.mean_response_time_ms, expected_sum / 2000);
        assert_eq!(b.mean_response_time_ms(), expected_sum / 2000);
    }

    #[test]
    fn stats_reports_limiter() {
        let b = Backend::new("a", Url::parse("http://127.0.0.1:3001").unwrap(), 10)
            .with_rate_limiter(RateLimiter::token_bucket(
                std::time::Duration::from_secs(1),
                4,
            ));
        let stats = b.stats();
        assert!(stats.rate_limited);
        assert_eq!(stats.rate_limiter_level, Some(0));
        assert_eq!(stats.max_connections, 10);
    }
}

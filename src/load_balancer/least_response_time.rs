// src/load_balancer/least_response_time.rs
use crate::load_balancer::{Instrumentation, LoadBalancer};
use crate::proxy::Backend;
use std::sync::Arc;

/// Picks the backend with the lowest mean response time.
///
/// A backend that has not served anything yet reports a mean of 0 and is
/// preferred until it records its first sample.
#[derive(Debug, Default)]
pub struct LeastResponseTimeBalancer;

impl LeastResponseTimeBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastResponseTimeBalancer {
    fn select_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        backends
            .iter()
            .min_by_key(|b| b.mean_response_time_ms())
            .cloned()
    }

    fn instrumentation(&self) -> Instrumentation {
        Instrumentation::TrackResponseTime
    }

    fn name(&self) -> &'static str {
        "least_response_time"
    }
}

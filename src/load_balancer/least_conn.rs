// src/load_balancer/least_conn.rs
use crate::load_balancer::{Instrumentation, LoadBalancer};
use crate::proxy::Backend;
use std::sync::Arc;

/// Picks the backend with the fewest in-flight requests.
/// Ties go to the earliest backend in configuration order.
#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer;

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn select_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        // `min_by_key` keeps the first of equal minima.
        backends
            .iter()
            .min_by_key(|b| b.active_connections())
            .cloned()
    }

    fn instrumentation(&self) -> Instrumentation {
        Instrumentation::TrackConnections
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

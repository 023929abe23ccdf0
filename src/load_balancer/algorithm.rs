// src/load_balancer/algorithm.rs
use crate::proxy::Backend;
use std::sync::Arc;

/// Per-request bookkeeping a strategy needs from the forwarding pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instrumentation {
    /// Forward only.
    Plain,
    /// Trace header plus an active-connection slot held for the whole call.
    TrackConnections,
    /// As `TrackConnections`, and the call's latency feeds the backend mean.
    TrackResponseTime,
}

impl Instrumentation {
    pub fn tags_requests(self) -> bool {
        !matches!(self, Self::Plain)
    }
}

pub trait LoadBalancer: Send + Sync {
    fn select_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;

    fn instrumentation(&self) -> Instrumentation {
        Instrumentation::Plain
    }

    fn name(&self) -> &'static str;
}

// src/load_balancer/mod.rs
mod algorithm;
mod least_conn;
mod least_response_time;
mod random;
mod round_robin;

pub use algorithm::{Instrumentation, LoadBalancer}; // trait
pub use least_conn::LeastConnectionsBalancer;
pub use least_response_time::LeastResponseTimeBalancer;
pub use random::RandomBalancer;
pub use round_robin::RoundRobinBalancer;
pub use crate::config::LoadBalancerAlgorithm;

use std::sync::Arc;

/// Resolve the configured algorithm once, at startup.
pub fn create_load_balancer(algorithm: LoadBalancerAlgorithm) -> Arc<dyn LoadBalancer> {
    match algorithm {
        LoadBalancerAlgorithm::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        LoadBalancerAlgorithm::Random => Arc::new(RandomBalancer::new()),
        LoadBalancerAlgorithm::LeastConnections => Arc::new(LeastConnectionsBalancer::new()),
        LoadBalancerAlgorithm::LeastResponseTime => Arc::new(LeastResponseTimeBalancer::new()),
    }
}

#[cfg(test)]
pub(crate) fn test_backends(n: usize) -> Vec<Arc<crate::proxy::Backend>> {
    (0..n)
        .map(|i| {
            let url = url::Url::parse(&format!("http://127.0.0.1:{}", 3000 + i)).unwrap();
            Arc::new(crate::proxy::Backend::new(format!("b{i}"), url, 1000))
        })
        .collect()
}

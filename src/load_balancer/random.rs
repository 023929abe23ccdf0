// src/load_balancer/random.rs
use crate::load_balancer::LoadBalancer;
use crate::proxy::Backend;
use rand::Rng;
use std::sync::Arc;

/// Uniform pick per request, no shared state.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for RandomBalancer {
    fn select_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..backends.len());
        Some(backends[index].clone())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

// src/load_balancer/round_robin.rs
use crate::load_balancer::LoadBalancer;
use crate::proxy::Backend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        // Pre-increment, so the first request lands on index 1.
        let next = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        Some(backends[next % backends.len()].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_backends;
    use proptest::prelude::*;

    #[test]
    fn cycles_starting_after_cursor() {
        let backends = test_backends(3);
        let lb = RoundRobinBalancer::new();
        let picked: Vec<_> = (0..7)
            .map(|_| lb.select_backend(&backends).unwrap().name.clone())
            .collect();
        assert_eq!(picked, ["b1", "b2", "b0", "b1", "b2", "b0", "b1"]);
    }

    #[test]
    fn empty_pool_yields_none() {
        assert!(RoundRobinBalancer::new().select_backend(&[]).is_none());
    }

    proptest! {
        #[test]
        fn sequential_picks_are_strictly_cyclic(n in 1usize..12, m in 1usize..64, skip in 0usize..20) {
            let backends = test_backends(n);
            let lb = RoundRobinBalancer::new();
            for _ in 0..skip {
                lb.select_backend(&backends);
            }

            let index_of = |b: &Arc<Backend>| backends.iter().position(|x| Arc::ptr_eq(x, b)).unwrap();
            let k0 = skip % n;
            for i in 1..=m {
                let picked = lb.select_backend(&backends).unwrap();
                prop_assert_eq!(index_of(&picked), (k0 + i) % n);
            }
        }
    }
}

//
// src/proxy/registry.rs
//

use super::backend::{Backend, BackendStats};
use crate::config::{BackendConfig, ConfigError};
use crate::rate_limit::RateLimiter;
use std::sync::Arc;

/// The fixed, ordered set of backends the proxy balances across.
///
/// Built once at startup; never grows or shrinks afterwards.
#[derive(Debug)]
pub struct BackendRegistry {
    backends: Vec<Arc<Backend>>,
}

impl BackendRegistry {
    pub fn new(backends: Vec<Arc<Backend>>) -> Result<Self, ConfigError> {
        if backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        Ok(Self { backends })
    }

    pub fn from_config(configs: &[BackendConfig]) -> Result<Self, ConfigError> {
        let mut backends = Vec::with_capacity(configs.len());

        for config in configs {
            let mut backend = Backend::new(&config.name, config.url()?, config.max_connections);

            if let Some(rate_limit) = &config.rate_limit {
                match RateLimiter::from_config(rate_limit) {
                    Some(limiter) => {
                        tracing::info!(
                            backend = %config.name,
                            kind = ?limiter.kind(),
                            capacity = limiter.capacity(),
                            interval = ?limiter.interval(),
                            "rate limiting enabled"
                        );
                        backend = backend.with_rate_limiter(limiter);
                    }
                    None => {
                        tracing::warn!(
                            backend = %config.name,
                            "unrecognized rate limiter type, backend will not be rate limited"
                        );
                    }
                }
            }

            backends.push(Arc::new(backend));
        }

        Self::new(backends)
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn get_backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.iter().find(|b| b.name == name).cloned()
    }

    /// Spawn every backend's limiter ticker. Needs a running tokio runtime.
    pub fn start_rate_limiters(&self) {
        for limiter in self.backends.iter().filter_map(|b| b.rate_limiter()) {
            limiter.start();
        }
    }

    /// Stop every limiter ticker and wait for them to exit.
    pub async fn shutdown(&self) {
        for backend in &self.backends {
            if let Some(limiter) = backend.rate_limiter() {
                limiter.shutdown().await;
            }
        }
        tracing::info!("Stopped rate limiters for {} backends", self.backends.len());
    }

    pub fn stats(&self) -> Vec<BackendStats> {
        self.backends.iter().map(|b| b.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::rate_limit::LimiterKind;

    fn config(name: &str, path: &str, rate_limit: Option<RateLimitConfig>) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            path: path.to_string(),
            max_connections: 1000,
            rate_limit,
        }
    }

    #[test]
    fn builds_backends_in_config_order() {
        let registry = BackendRegistry::from_config(&[
            config("a", "http://127.0.0.1:3001", None),
            config(
                "b",
                "http://127.0.0.1:3002",
                Some(RateLimitConfig::TokenBucket {
                    generation_time_ms: 1000,
                    max_token: 2,
                }),
            ),
            config("c", "http://127.0.0.1:3003", Some(RateLimitConfig::Unrecognized)),
        ])
        .unwrap();

        let names: Vec<_> = registry.backends().iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(registry.backends()[0].rate_limiter().is_none());
        assert_eq!(
            registry.backends()[1].rate_limiter().map(|l| l.kind()),
            Some(LimiterKind::TokenBucket)
        );
        assert!(registry.backends()[2].rate_limiter().is_none());
        assert_eq!(registry.get_backend("c").unwrap().url.port(), Some(3003));
        assert!(registry.get_backend("missing").is_none());
    }

    #[test]
    fn empty_registry_is_rejected() {
        assert!(matches!(
            BackendRegistry::from_config(&[]),
            Err(ConfigError::NoBackends)
        ));
    }

    #[test]
    fn bad_url_is_rejected() {
        assert!(matches!(
            BackendRegistry::from_config(&[config("a", "::nope::", None)]),
            Err(ConfigError::InvalidBackendUrl { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn starts_and_stops_limiters() {
        let registry = BackendRegistry::from_config(&[config(
            "a",
            "http://127.0.0.1:3001",
            Some(RateLimitConfig::LeakyBucket {
                leaky_rate_ms: 100,
                max_capacity: 1,
            }),
        )])
        .unwrap();

        registry.start_rate_limiters();
        let limiter = registry.backends()[0].rate_limiter().unwrap();
        assert!(limiter.is_running());

        registry.shutdown().await;
        assert!(!limiter.is_running());
    }
}

// src/config/models.rs
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

use super::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub balancing: BalancingConfig,
    pub backends: Vec<BackendConfig>,
    /// Parsed for compatibility with existing config files; never consulted
    /// when picking a backend.
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalancingConfig {
    #[serde(rename = "type")]
    pub algorithm: LoadBalancerAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerAlgorithm {
    RoundRobin,
    Random,
    LeastConnections,
    LeastResponseTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    /// Base URL of the upstream, e.g. `http://127.0.0.1:3001`.
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl BackendConfig {
    pub fn url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.path).map_err(|e| ConfigError::InvalidBackendUrl {
            backend: self.name.clone(),
            reason: e.to_string(),
        })?;

        if url.host_str().is_none() || !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBackendUrl {
                backend: self.name.clone(),
                reason: "expected an absolute http(s) URL with a host".to_string(),
            });
        }

        Ok(url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimitConfig {
    TokenBucket {
        generation_time_ms: u64,
        max_token: u64,
    },
    LeakyBucket {
        leaky_rate_ms: u64,
        max_capacity: u64,
    },
    /// Any other `type`; the backend then runs without a limiter.
    #[serde(other)]
    Unrecognized,
}

impl RateLimitConfig {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Self::TokenBucket { generation_time_ms, .. } => {
                Some(Duration::from_millis(*generation_time_ms))
            }
            Self::LeakyBucket { leaky_rate_ms, .. } => Some(Duration::from_millis(*leaky_rate_ms)),
            Self::Unrecognized => None,
        }
    }

    pub fn capacity(&self) -> Option<u64> {
        match self {
            Self::TokenBucket { max_token, .. } => Some(*max_token),
            Self::LeakyBucket { max_capacity, .. } => Some(*max_capacity),
            Self::Unrecognized => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingRule {
    pub path: String,
    pub backend: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Reject anything the proxy cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.metrics.enabled && self.metrics.port == self.port {
            return Err(ConfigError::MetricsPortConflict(self.port));
        }

        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::DuplicateBackend(backend.name.clone()));
            }

            backend.url()?;

            if let Some(limit) = &backend.rate_limit {
                let zero_interval = limit.interval().is_some_and(|i| i.is_zero());
                let zero_capacity = limit.capacity() == Some(0);
                if zero_interval || zero_capacity {
                    return Err(ConfigError::InvalidRateLimit {
                        backend: backend.name.clone(),
                        reason: "interval and capacity must be greater than zero".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Startup-fatal configuration problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one backend must be configured")]
    NoBackends,

    #[error("listen port must be non-zero")]
    InvalidPort,

    #[error("metrics listener port {0} clashes with the proxy port")]
    MetricsPortConflict(u16),

    #[error("duplicate backend name: {0}")]
    DuplicateBackend(String),

    #[error("invalid URL for backend {backend}: {reason}")]
    InvalidBackendUrl { backend: String, reason: String },

    #[error("invalid rate limit for backend {backend}: {reason}")]
    InvalidRateLimit { backend: String, reason: String },
}

/// Load configuration from a file (YAML or JSON), with `LB__`-prefixed
/// environment variables layered on top (e.g. `LB__PORT=8081`).
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    load_with_env(path.as_ref(), None)
}

/// `env: None` reads the process environment.
fn load_with_env(path: &Path, env: Option<::config::Map<String, String>>) -> Result<Config> {
    let settings = ::config::Config::builder()
        .add_source(::config::File::from(path))
        .add_source(
            ::config::Environment::with_prefix("LB")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        )
        .build()
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config: Config = settings
        .try_deserialize()
        .context("Failed to parse config")?;

    config.validate()?;
    Ok(config)
}

// src/main.rs
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use throttled_balancer::{
    config,
    load_balancer::create_load_balancer,
    metrics::MetricsRegistry,
    proxy::{BackendRegistry, Proxy},
    server::{start_admin_server, AdminState, RequestHandler, ServerBuilder},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("throttled_balancer=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path)?;

    if !config.routing_rules.is_empty() {
        info!(
            "Ignoring {} routing rule(s); requests are balanced across all backends",
            config.routing_rules.len()
        );
    }

    // Initialize metrics
    let metrics_registry = Arc::new(MetricsRegistry::new()?);
    let metrics = metrics_registry.collector();

    // Create backend registry and start its rate limiters
    let registry = Arc::new(
        BackendRegistry::from_config(&config.backends).context("Invalid backend configuration")?,
    );
    registry.start_rate_limiters();

    // Create proxy
    let balancer = create_load_balancer(config.balancing.algorithm);
    info!(
        "Balancing across {} backends with {}",
        registry.len(),
        balancer.name()
    );
    let proxy = Arc::new(Proxy::new(registry.clone(), balancer, Some(metrics)));

    // Start metrics server if enabled
    if config.metrics.enabled {
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_admin_server(
            metrics_addr,
            AdminState {
                metrics: metrics_registry.clone(),
                backends: registry.clone(),
                metrics_path: Arc::from(config.metrics.path.as_str()),
            },
        )?;
    }

    // Create request handler
    let handler = RequestHandler::new(proxy);

    // Start main server
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!("Starting load balancer on {}", addr);

    ServerBuilder::new(addr)
        .with_handler(handler)
        .with_shutdown(shutdown_signal())
        .serve()
        .await?;

    registry.shutdown().await;
    info!("Load balancer stopped");

    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::proxy::ClientAddr;
use crate::server::listener::bind_tcp;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use hyper::{server::conn::Http, Body, Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::{Service, ServiceBuilder};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Builder pattern so `main.rs` can inject its Proxy (or any handler).
pub struct ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    addr: SocketAddr,
    handler: Option<H>,
    shutdown: Option<BoxFuture<'static, ()>>,
}

impl<H> ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            handler: None,
            shutdown: None,
        }
    }

    /// Inject your request handler (usually wraps `proxy::Proxy`).
    pub fn with_handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Stop accepting connections once `signal` resolves.
    pub fn with_shutdown(mut self, signal: impl Future<Output = ()> + Send + 'static) -> Self {
        self.shutdown = Some(Box::pin(signal));
        self
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve(self) -> Result<()> {
        let listener = bind_tcp(self.addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already-bound listener, one Tokio task per connection.
    pub async fn serve_listener(self, listener: TcpListener) -> Result<()> {
        let handler = self
            .handler
            .context("handler must be set via with_handler()")?;
        let mut shutdown = self
            .shutdown
            .unwrap_or_else(|| Box::pin(std::future::pending()));

        tracing::info!("HTTP server listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        // Out of file descriptors and the like: back off instead of spinning.
                        tracing::warn!(%err, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    tracing::info!("HTTP server no longer accepting connections");
                    return Ok(());
                }
            };

            // Tag each request with the peer so the proxy can set X-Forwarded-For.
            let svc = ServiceBuilder::new()
                .map_request(move |mut req: Request<Body>| {
                    req.extensions_mut().insert(ClientAddr(peer));
                    req
                })
                .service(handler.clone());

            tokio::spawn(async move {
                let http = Http::new();
                if let Err(err) = http.serve_connection(stream, svc).await {
                    tracing::warn!(%peer, %err, "connection error");
                }
            });
        }
    }
}

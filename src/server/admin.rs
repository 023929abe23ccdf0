// src/server/admin.rs
// Metrics and backend statistics listener.
use crate::metrics::MetricsRegistry;
use crate::proxy::BackendRegistry;
use anyhow::{Context, Result};
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Clone)]
pub struct AdminState {
    pub metrics: Arc<MetricsRegistry>,
    pub backends: Arc<BackendRegistry>,
    pub metrics_path: Arc<str>,
}

pub fn admin_response(state: &AdminState, req: &Request<Body>) -> Response<Body> {
    if req.method() != Method::GET {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }

    let path = req.uri().path();
    if path == &*state.metrics_path {
        match state.metrics.gather() {
            Ok(body) => with_content_type(body.into(), "text/plain; version=0.0.4"),
            Err(e) => {
                error!(%e, "failed to encode metrics");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    } else if path == "/stats" {
        match serde_json::to_vec(&state.backends.stats()) {
            Ok(body) => with_content_type(body.into(), "application/json"),
            Err(e) => {
                error!(%e, "failed to encode backend stats");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    } else {
        plain(StatusCode::NOT_FOUND, "Not Found")
    }
}

/// Bind the admin listener and serve it in the background.
pub fn start_admin_server(addr: SocketAddr, state: AdminState) -> Result<(SocketAddr, JoinHandle<()>)> {
    let make_service = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let response = admin_response(&state, &req);
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind admin listener on {}", addr))?
        .serve(make_service);
    let local_addr = server.local_addr();

    info!("Metrics server listening on http://{}", local_addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok((local_addr, handle))
}

fn with_content_type(body: Body, content_type: &'static str) -> Response<Body> {
    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    response
}

fn plain(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

//! src/bin/test_backend.rs
//! Run: cargo run --bin test_backend -- <port> [name]

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use rand::Rng;
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;

#[derive(Clone)]
struct BackendState {
    port: u16,
    name: String,
    req_counter: Arc<AtomicU64>,
    base_delay: u64,
    jitter_ms: u64,
    fail_pct: f64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

async fn handle(req: Request<Body>, state: BackendState) -> Result<Response<Body>, Infallible> {
    let n = state.req_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let path = req.uri().path().to_owned();
    let request_id = req.headers().get("x-request-id").cloned();

    let delay = state.base_delay + rand::thread_rng().gen_range(0..=state.jitter_ms);
    if delay > 0 {
        sleep(Duration::from_millis(delay)).await;
    }

    if state.fail_pct > 0.0 && rand::thread_rng().gen_bool((state.fail_pct / 100.0).min(1.0)) {
        let mut response = Response::new(Body::from("Injected failure"));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return Ok(response);
    }

    let body = serde_json::json!({
        "backend": state.name,
        "port": state.port,
        "req": n,
        "path": path,
        "delay_ms": delay,
    });

    let mut response = Response::new(Body::from(body.to_string()));
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    if let Ok(name) = hyper::header::HeaderValue::from_str(&state.name) {
        headers.insert("x-backend-name", name);
    }
    if let Some(id) = request_id {
        headers.insert("x-request-id", id);
    }
    Ok(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let port: u16 = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "3001".into())
        .parse()?;
    let name = std::env::args()
        .nth(2)
        .or_else(|| std::env::var("BACKEND_NAME").ok())
        .unwrap_or_else(|| format!("backend-{port}"));

    let state = BackendState {
        port,
        name: name.clone(),
        req_counter: Arc::new(AtomicU64::new(0)),
        base_delay: env_or("BASE_DELAY_MS", 0),
        jitter_ms: env_or("JITTER_MS", 0),
        fail_pct: env_or("FAIL_PCT", 0.0),
    };

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    println!(
        "Test backend '{}' on http://{}  [delay={}ms±{} fail={}%]",
        name, addr, state.base_delay, state.jitter_ms, state.fail_pct
    );

    let make_svc = make_service_fn(move |_conn| {
        let st = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, st.clone()))) }
    });

    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

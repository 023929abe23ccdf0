// ────────────────────────────────
// src/proxy/proxy.rs
// Proxy component that handles HTTP request forwarding
// ────────────────────────────────

use super::backend::{Backend, ConnectionGuard};
use super::registry::BackendRegistry;
use crate::load_balancer::{Instrumentation, LoadBalancer};
use crate::metrics::MetricsCollector;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, RETRY_AFTER};
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Address of the downstream client, attached to each request by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

pub struct Proxy {
    registry: Arc<BackendRegistry>,
    balancer: Arc<dyn LoadBalancer>,
    client: HttpClient,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Proxy {
    pub fn new(
        registry: Arc<BackendRegistry>,
        balancer: Arc<dyn LoadBalancer>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let client = Client::builder().build::<_, Body>(HttpsConnector::new());

        Self {
            registry,
            balancer,
            client,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn balancer(&self) -> &dyn LoadBalancer {
        self.balancer.as_ref()
    }

    /// Select a backend, pass its rate limiter, forward.
    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let backend = self
            .balancer
            .select_backend(self.registry.backends())
            .ok_or(ProxyError::NoBackends)?;

        if let Some(limiter) = backend.rate_limiter() {
            if let Err(rejected) = limiter.admit() {
                warn!(
                    backend = %backend.name,
                    retry_after = rejected.retry_after_secs,
                    "rate limit exceeded"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_rate_limited(&backend.name);
                }
                return Err(ProxyError::RateLimited {
                    backend: backend.name.clone(),
                    retry_after_secs: rejected.retry_after_secs,
                });
            }
        }

        self.forward(backend, req).await
    }

    async fn forward(
        &self,
        backend: Arc<Backend>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let hooks = RequestHooks::new(backend.clone(), self.balancer.instrumentation());

        let mut outbound = rewrite_request(&backend.url, req)?;
        hooks.before_forward(&mut outbound);

        debug!(
            backend = %backend.name,
            method = %outbound.method(),
            uri = %outbound.uri(),
            request_id = ?hooks.request_id(),
            "forwarding request"
        );

        match self.client.request(outbound).await {
            Ok(mut response) => {
                remove_hop_by_hop_headers(response.headers_mut());
                let elapsed = hooks.after_response(&mut response);

                if let Some(metrics) = &self.metrics {
                    metrics.record_request(&backend.name, response.status().as_u16(), elapsed);
                    self.publish_backend_gauges(metrics, &backend);
                }

                debug!(
                    backend = %backend.name,
                    status = response.status().as_u16(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "upstream responded"
                );
                Ok(response)
            }
            Err(err) => {
                // Releases the connection slot, if one was taken.
                drop(hooks);

                warn!(backend = %backend.name, %err, "upstream request failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_upstream_error(&backend.name);
                    self.publish_backend_gauges(metrics, &backend);
                }
                Err(ProxyError::BackendError(err.to_string()))
            }
        }
    }

    fn publish_backend_gauges(&self, metrics: &MetricsCollector, backend: &Backend) {
        metrics.update_backend_connections(&backend.name, backend.active_connections());
        metrics.update_backend_mean_response_time(&backend.name, backend.mean_response_time_ms());
    }
}

#[derive(Default)]
struct HookState {
    started: Option<Instant>,
    slot: Option<ConnectionGuard>,
}

/// The pre-forward / post-response pair for one request.
///
/// Both halves run under the same lock so that the start time and the
/// connection slot are handed over intact even if completion ever runs on
/// another task. Dropping the hooks releases the slot.
struct RequestHooks {
    backend: Arc<Backend>,
    instrumentation: Instrumentation,
    request_id: Option<HeaderValue>,
    state: Mutex<HookState>,
}

impl RequestHooks {
    fn new(backend: Arc<Backend>, instrumentation: Instrumentation) -> Self {
        let request_id = instrumentation
            .tags_requests()
            .then(|| Uuid::new_v4().to_string())
            .and_then(|id| HeaderValue::from_str(&id).ok());

        Self {
            backend,
            instrumentation,
            request_id,
            state: Mutex::new(HookState::default()),
        }
    }

    fn request_id(&self) -> Option<&str> {
        self.request_id.as_ref().and_then(|id| id.to_str().ok())
    }

    fn before_forward(&self, req: &mut Request<Body>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(id) = &self.request_id {
            req.headers_mut().insert(REQUEST_ID_HEADER, id.clone());
        }
        if self.instrumentation != Instrumentation::Plain {
            state.slot = Some(self.backend.connection_guard());
        }
        state.started = Some(Instant::now());
    }

    fn after_response(&self, res: &mut Response<Body>) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(id) = &self.request_id {
            res.headers_mut().insert(REQUEST_ID_HEADER, id.clone());
        }

        let elapsed = state
            .started
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default();
        state.slot.take();

        match self.instrumentation {
            Instrumentation::Plain => {}
            Instrumentation::TrackConnections => self.backend.increment_total(),
            Instrumentation::TrackResponseTime => {
                self.backend.record_response_time(elapsed.as_millis() as u64)
            }
        }

        elapsed
    }
}

/// Point the request at `target`, keeping method, headers and body.
fn rewrite_request(target: &Url, req: Request<Body>) -> Result<Request<Body>, ProxyError> {
    let (mut parts, body) = req.into_parts();

    parts.uri = upstream_uri(target, &parts.uri)?;
    remove_hop_by_hop_headers(&mut parts.headers);

    if let Some(ClientAddr(peer)) = parts.extensions.get::<ClientAddr>().copied() {
        append_forwarded_for(&mut parts.headers, peer);
    }

    Ok(Request::from_parts(parts, body))
}

/// Join the backend base URL with the request's path and query the way a
/// single-host reverse proxy does. The client's path and query are copied
/// byte for byte; only the backend's own prefix is prepended.
pub fn upstream_uri(target: &Url, uri: &Uri) -> Result<Uri, ProxyError> {
    let host = target
        .host_str()
        .ok_or_else(|| ProxyError::InvalidUri(format!("{target} has no host")))?;
    let authority = match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut path_and_query = join_paths(target.path(), uri.path());
    match (target.query().unwrap_or(""), uri.query().unwrap_or("")) {
        ("", "") => {}
        (q, "") | ("", q) => {
            path_and_query.push('?');
            path_and_query.push_str(q);
        }
        (a, b) => {
            path_and_query.push('?');
            path_and_query.push_str(a);
            path_and_query.push('&');
            path_and_query.push_str(b);
        }
    }

    Uri::builder()
        .scheme(target.scheme())
        .authority(authority.as_str())
        .path_and_query(path_and_query.as_str())
        .build()
        .map_err(|e| ProxyError::InvalidUri(e.to_string()))
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, ip),
        None => ip,
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

// Custom error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No backends available")]
    NoBackends,

    #[error("Rate limit exceeded for backend {backend}")]
    RateLimited {
        backend: String,
        retry_after_secs: u64,
    },

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Invalid upstream URI: {0}")]
    InvalidUri(String),
}

// Convert ProxyError to Hyper Response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let (status, message) = match &err {
            ProxyError::NoBackends => (StatusCode::SERVICE_UNAVAILABLE, "No backends available"),
            ProxyError::RateLimited { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "Rate limit exceeded")
            }
            ProxyError::BackendError(_) | ProxyError::InvalidUri(_) => {
                (StatusCode::BAD_GATEWAY, "Bad gateway")
            }
        };

        let mut response = Response::new(Body::from(message));
        *response.status_mut() = status;

        if let ProxyError::RateLimited {
            retry_after_secs, ..
        } = err
        {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::{LeastConnectionsBalancer, LeastResponseTimeBalancer};
    use crate::rate_limit::RateLimiter;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn backend(name: &str) -> Arc<Backend> {
        Arc::new(Backend::new(name, url("http://127.0.0.1:3001"), 1000))
    }

    #[test]
    fn joins_paths_with_single_slash() {
        let uri: Uri = "/users/7?x=1".parse().unwrap();
        assert_eq!(
            upstream_uri(&url("http://10.0.0.1:8080"), &uri).unwrap(),
            "http://10.0.0.1:8080/users/7?x=1"
        );
        assert_eq!(
            upstream_uri(&url("http://10.0.0.1:8080/api/"), &uri).unwrap(),
            "http://10.0.0.1:8080/api/users/7?x=1"
        );
        assert_eq!(
            upstream_uri(&url("https://svc.internal/api?key=k"), &uri).unwrap(),
            "https://svc.internal/api/users/7?key=k&x=1"
        );
        assert_eq!(
            upstream_uri(&url("http://svc/base?key=k"), &"/".parse().unwrap()).unwrap(),
            "http://svc/base/?key=k"
        );
    }

    #[test]
    fn passes_dot_segments_and_query_through_untouched() {
        let base = url("http://127.0.0.1:3001");
        for raw in ["/a/../admin", "/a/./b", "/x/%2E%2E/y", "/q?name=o'neil", "/s?a=%20b&c"] {
            let uri: Uri = raw.parse().unwrap();
            assert_eq!(
                upstream_uri(&base, &uri).unwrap(),
                format!("http://127.0.0.1:3001{raw}").as_str()
            );
        }

        let uri: Uri = "/x/../y?p=1".parse().unwrap();
        assert_eq!(
            upstream_uri(&url("https://[::1]:8443/api?k=v"), &uri).unwrap(),
            "https://[::1]:8443/api/x/../y?k=v&p=1"
        );
    }

    #[test]
    fn strips_hop_by_hop_and_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-kept", HeaderValue::from_static("yes"));

        remove_hop_by_hop_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-kept"], "yes");
    }

    #[test]
    fn rewrite_appends_forwarded_for() {
        let mut req = Request::builder()
            .uri("/ping")
            .header(X_FORWARDED_FOR, "203.0.113.9")
            .header("x-custom", "v")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ClientAddr("192.0.2.4:5555".parse().unwrap()));

        let out = rewrite_request(&url("http://127.0.0.1:3001"), req).unwrap();
        assert_eq!(out.uri(), "http://127.0.0.1:3001/ping");
        assert_eq!(out.headers()[X_FORWARDED_FOR], "203.0.113.9, 192.0.2.4");
        assert_eq!(out.headers()["x-custom"], "v");
    }

    #[test]
    fn rate_limited_error_carries_retry_after() {
        let response: Response<Body> = ProxyError::RateLimited {
            backend: "a".into(),
            retry_after_secs: 2,
        }
        .into();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "2");

        let response: Response<Body> = ProxyError::BackendError("refused".into()).into();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }

    #[test]
    fn hooks_hold_slot_between_forward_and_response() {
        let b = backend("a");
        let hooks = RequestHooks::new(b.clone(), Instrumentation::TrackConnections);
        let mut req = Request::new(Body::empty());

        hooks.before_forward(&mut req);
        assert_eq!(b.active_connections(), 1);
        let id = req.headers()[REQUEST_ID_HEADER].clone();

        let mut res = Response::new(Body::empty());
        hooks.after_response(&mut res);
        assert_eq!(b.active_connections(), 0);
        assert_eq!(res.headers()[REQUEST_ID_HEADER], id);
        assert_eq!(b.total_requests(), 1);
    }

    #[test]
    fn dropped_hooks_release_slot_without_sample() {
        let b = backend("a");
        let hooks = RequestHooks::new(b.clone(), Instrumentation::TrackResponseTime);
        hooks.before_forward(&mut Request::new(Body::empty()));
        assert_eq!(b.active_connections(), 1);

        drop(hooks);
        assert_eq!(b.active_connections(), 0);
        assert_eq!(b.total_requests(), 0);
    }

    #[test]
    fn plain_hooks_do_not_tag_or_count() {
        let b = backend("a");
        let hooks = RequestHooks::new(b.clone(), Instrumentation::Plain);
        let mut req = Request::new(Body::empty());
        hooks.before_forward(&mut req);

        assert!(hooks.request_id().is_none());
        assert!(req.headers().get(REQUEST_ID_HEADER).is_none());
        assert_eq!(b.active_connections(), 0);
    }

    #[tokio::test]
    async fn rejected_request_touches_no_statistics() {
        let limited = Arc::new(
            Backend::new("a", url("http://127.0.0.1:1"), 1000).with_rate_limiter(
                RateLimiter::token_bucket(Duration::from_millis(1500), 3),
            ),
        );
        let registry = Arc::new(BackendRegistry::new(vec![limited.clone()]).unwrap());
        let proxy = Proxy::new(registry, Arc::new(LeastConnectionsBalancer::new()), None);

        let err = proxy.handle(Request::new(Body::empty())).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::RateLimited {
                retry_after_secs: 1,
                ..
            }
        ));
        assert_eq!(limited.active_connections(), 0);
        assert_eq!(limited.total_requests(), 0);
    }

    #[tokio::test]
    async fn failed_upstream_releases_connection() {
        // Bind then drop a listener to get a port nothing is serving on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let dead = Arc::new(Backend::new(
            "dead",
            url(&format!("http://127.0.0.1:{port}")),
            1000,
        ));
        let registry = Arc::new(BackendRegistry::new(vec![dead.clone()]).unwrap());
        let proxy = Proxy::new(registry, Arc::new(LeastResponseTimeBalancer::new()), None);

        let err = proxy.handle(Request::new(Body::empty())).await.unwrap_err();
        assert!(matches!(err, ProxyError::BackendError(_)));
        assert_eq!(dead.active_connections(), 0);
        assert_eq!(dead.mean_response_time_ms(), 0);
    }
}

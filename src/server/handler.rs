// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::sync::Arc;
use tower::Service;

use crate::proxy::Proxy;

/// Dispatcher: every inbound request goes through [`Proxy::handle`], and
/// proxy errors become their HTTP responses here.
#[derive(Clone)]
pub struct RequestHandler {
    proxy: Arc<Proxy>,
}

impl RequestHandler {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        Self { proxy }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let proxy = self.proxy.clone();
        Box::pin(async move {
            Ok(proxy.handle(req).await.unwrap_or_else(|e| {
                tracing::debug!(%e, "request not proxied");
                e.into()
            }))
        })
    }
}

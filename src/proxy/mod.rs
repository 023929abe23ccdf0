//
// src/proxy/mod.rs
//
mod backend;
mod proxy;
mod registry;

pub use backend::{Backend, BackendStats, ConnectionGuard};
pub use proxy::{upstream_uri, ClientAddr, Proxy, ProxyError, REQUEST_ID_HEADER};
pub use registry::BackendRegistry;

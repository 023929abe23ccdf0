// src/lib.rs
pub mod config;
pub mod load_balancer;
pub mod metrics;
pub mod proxy;
pub mod rate_limit;
pub mod server;

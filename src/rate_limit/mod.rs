// src/rate_limit/mod.rs
mod limiter;

pub use limiter::{LimiterKind, RateLimiter, Rejected};

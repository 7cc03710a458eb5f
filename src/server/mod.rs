//! HTTP server exposing the cache to inference workers.
//!
//! - [`api`]: request/response types and route handlers
//! - [`metrics`]: Prometheus registry

pub mod api;
pub mod metrics;

//! HTTP surface
//!
//! Echo endpoint, static status, and the health/readiness/liveness probes
//! for container orchestration, all under `/{service name}`.
//!
//! - [`routes`] - route table and handlers
//! - [`server`] - bind, serve and graceful shutdown

pub mod routes;
pub mod server;

pub use routes::{is_healthy, routes, HealthStatus, HttpState};
pub use server::HttpServer;

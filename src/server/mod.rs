//! Admin HTTP server.
//!
//! - [`admin_api`]: routes and handlers
//! - [`metrics`]: Prometheus gauges

pub mod admin_api;
pub mod metrics;

pub use admin_api::{build_router, AppState};

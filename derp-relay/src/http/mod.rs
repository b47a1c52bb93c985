//! HTTP routes served on the relay listener.
//!
//! Besides the `/derp` upgrade endpoint this provides probes, bootstrap DNS,
//! the home page and captive-portal detection. [`connection`] adapts the
//! router to one accepted connection, including the h2c upgrade.

pub mod bootstrap_dns;
pub mod connection;
pub mod home;
pub mod probe;

use crate::bridge;
use crate::engine::RelayServer;
use axum::routing::any;
use axum::{Extension, Router};
use std::sync::Arc;

pub use bootstrap_dns::BootstrapDns;
pub use connection::ConnectionService;
pub use home::HomePage;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<RelayServer>, home: HomePage, dns: BootstrapDns) -> Router {
    Router::new()
        .route("/derp", any(bridge::relay_handler))
        .route("/derp/probe", any(probe::probe_handler))
        .route("/derp/latency-check", any(probe::probe_handler))
        .route("/bootstrap-dns", any(bootstrap_dns::bootstrap_dns_handler))
        .route("/robots.txt", any(home::robots_handler))
        .route("/generate_204", any(probe::generate_204_handler))
        .route("/", any(home::home_handler))
        .fallback(home::home_handler)
        .layer(Extension(relay))
        .layer(Extension(Arc::new(home)))
        .layer(Extension(Arc::new(dns)))
}

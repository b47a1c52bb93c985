//! `/bootstrap-dns`: lets clients resolve control-plane names through the relay.

use super::home::with_browser_headers;
use crate::dialer::{DnsLookup, QueryOptions};
use axum::extract::Query;
use axum::http::header::{CONNECTION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Resolver and options the handler queries with.
#[derive(Clone)]
pub struct BootstrapDns {
    /// The DNS collaborator.
    pub resolver: Arc<dyn DnsLookup>,
    /// Options of the inbound's dialer.
    pub options: QueryOptions,
}

impl std::fmt::Debug for BootstrapDns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapDns")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Query string of a bootstrap request.
#[derive(Debug, Deserialize)]
pub struct DnsQuery {
    /// Domain to resolve; empty answers `{}`.
    #[serde(default)]
    pub q: String,
}

/// Handler for `/bootstrap-dns?q=<domain>`, any method.
pub async fn bootstrap_dns_handler(
    Extension(dns): Extension<Arc<BootstrapDns>>,
    Query(query): Query<DnsQuery>,
) -> Response {
    let headers = [(CONTENT_TYPE, "application/json"), (CONNECTION, "close")];
    if query.q.is_empty() {
        return with_browser_headers((headers, "{}"));
    }

    match dns.resolver.lookup(&query.q, &dns.options).await {
        Ok(addresses) => {
            let answer: HashMap<String, Vec<IpAddr>> = HashMap::from([(query.q, addresses)]);
            with_browser_headers((headers, Json(answer)))
        }
        Err(e) => {
            tracing::debug!("Bootstrap DNS lookup failed: {}", e);
            with_browser_headers((StatusCode::INTERNAL_SERVER_ERROR, headers).into_response())
        }
    }
}

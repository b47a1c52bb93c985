//! Operational counters for a relay inbound.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters, reset only on restart.
#[derive(Debug, Default)]
pub struct InboundMetrics {
    /// TCP connections accepted on the relay listener.
    pub connections_total: AtomicU64,
    /// TLS handshakes that failed.
    pub tls_handshake_failures: AtomicU64,
    /// HTTP connections that ended with an error.
    pub http_errors_total: AtomicU64,
    /// STUN binding requests answered.
    pub stun_responses_total: AtomicU64,
    /// Datagrams on the STUN port that were not binding requests.
    pub stun_ignored_total: AtomicU64,
}

/// Point-in-time copy of [`InboundMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// See [`InboundMetrics::connections_total`].
    pub connections_total: u64,
    /// See [`InboundMetrics::tls_handshake_failures`].
    pub tls_handshake_failures: u64,
    /// See [`InboundMetrics::http_errors_total`].
    pub http_errors_total: u64,
    /// See [`InboundMetrics::stun_responses_total`].
    pub stun_responses_total: u64,
    /// See [`InboundMetrics::stun_ignored_total`].
    pub stun_ignored_total: u64,
}

impl InboundMetrics {
    /// Increment a counter by one.
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            tls_handshake_failures: self.tls_handshake_failures.load(Ordering::Relaxed),
            http_errors_total: self.http_errors_total.load(Ordering::Relaxed),
            stun_responses_total: self.stun_responses_total.load(Ordering::Relaxed),
            stun_ignored_total: self.stun_ignored_total.load(Ordering::Relaxed),
        }
    }
}

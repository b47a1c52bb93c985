//! STUN responder loop.

use crate::error::{is_closed_or_canceled, is_retryable};
use crate::metrics::InboundMetrics;
use derp_types::stun;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Receive buffer size; larger than any UDP datagram.
const BUFFER_SIZE: usize = 64 << 10;

/// Pause after a transient receive error.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Answer STUN binding requests on `socket` until canceled.
///
/// Anything that is not a well-formed binding request is dropped without
/// a reply.
pub async fn serve(socket: Arc<UdpSocket>, metrics: Arc<InboundMetrics>, cancel: CancellationToken) {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buffer) => received,
        };
        let (n, source) = match received {
            Ok(received) => received,
            Err(e) if is_closed_or_canceled(&e) => return,
            Err(e) if is_retryable(&e) => {
                tracing::debug!("STUN receive interrupted: {}", e);
                continue;
            }
            Err(e) => {
                tracing::warn!("STUN receive error: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RETRY_DELAY) => continue,
                }
            }
        };

        let packet = &buffer[..n];
        if !stun::is(packet) {
            InboundMetrics::incr(&metrics.stun_ignored_total);
            continue;
        }
        let tx_id = match stun::parse_binding_request(packet) {
            Ok(tx_id) => tx_id,
            Err(_) => {
                InboundMetrics::incr(&metrics.stun_ignored_total);
                continue;
            }
        };

        let response = stun::response(tx_id, source);
        match socket.send_to(&response, source).await {
            Ok(_) => InboundMetrics::incr(&metrics.stun_responses_total),
            Err(e) => tracing::debug!("STUN reply to {} failed: {}", source, e),
        }
    }
}

//! Transport bridge for the `/derp` upgrade route.
//!
//! Clients reach the relay engine over either wire format:
//!
//! - **Binary**: `Upgrade: DERP` (or a legacy `Upgrade: WebSocket` without the
//!   `derp` subprotocol), answered with `101` and DERP framing on the raw
//!   upgraded connection.
//! - **WebSocket**: `Upgrade: websocket` plus `Sec-WebSocket-Protocol: derp`,
//!   with DERP framing inside binary WebSocket messages.
//!
//! Both become a [`RelaySession`] handed to [`RelayServer::accept`].

mod websocket;

pub use websocket::WsStream;

use crate::engine::{RelayServer, RelaySession, Transport};
use axum::body::Body;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, Request};
use axum::http::header::{CONNECTION, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use hyper_util::rt::TokioIo;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// WebSocket subprotocol name for DERP.
pub const SUBPROTOCOL: &str = "derp";

/// Response header carrying the relay's protocol version.
pub const DERP_VERSION: HeaderName = HeaderName::from_static("derp-version");

/// Response header carrying the relay's public key, as untyped hex.
pub const DERP_PUBLIC_KEY: HeaderName = HeaderName::from_static("derp-public-key");

/// Whether a request asks for the WebSocket-framed relay path.
///
/// Early clients sent `Upgrade: WebSocket` while still speaking binary DERP,
/// so the `derp` subprotocol must be offered too.
pub fn wants_websocket(headers: &HeaderMap) -> bool {
    let upgrade_is_ws = header_str(headers, &UPGRADE).eq_ignore_ascii_case("websocket");
    let offers_derp = headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(SUBPROTOCOL));
    upgrade_is_ws && offers_derp
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Handler for `/derp`.
pub async fn relay_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    request: Request,
) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

    if wants_websocket(request.headers()) {
        websocket_path(server, remote, request).await
    } else {
        binary_path(server, remote, request)
    }
}

async fn websocket_path(server: Arc<RelayServer>, remote: SocketAddr, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    upgrade
        .protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| serve_websocket(server, remote, socket))
}

async fn serve_websocket(server: Arc<RelayServer>, remote: SocketAddr, mut socket: WebSocket) {
    let negotiated = socket.protocol().and_then(|p| p.to_str().ok()) == Some(SUBPROTOCOL);
    if !negotiated {
        tracing::debug!("WebSocket client {} did not negotiate derp", remote);
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "client must speak the derp subprotocol".into(),
            })))
            .await;
        return;
    }

    let stream = Box::new(WsStream::new(socket));
    server
        .accept(RelaySession::new(stream, remote, Transport::WebSocket))
        .await;
}

fn binary_path(server: Arc<RelayServer>, remote: SocketAddr, mut request: Request) -> Response {
    let upgrade = header_str(request.headers(), &UPGRADE);
    if !(upgrade.eq_ignore_ascii_case("derp") || upgrade.eq_ignore_ascii_case("websocket")) {
        if !upgrade.is_empty() {
            tracing::debug!("Unexpected upgrade {:?} from {}", upgrade, remote);
        }
        return (StatusCode::UPGRADE_REQUIRED, "DERP requires connection upgrade").into_response();
    }

    let on_upgrade = hyper::upgrade::on(&mut request);
    let mut headers = HeaderMap::new();
    headers.insert(UPGRADE, HeaderValue::from_static("DERP"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(DERP_VERSION, HeaderValue::from(server.protocol_version()));
    if let Ok(key) = HeaderValue::from_str(&server.public_key().untyped_hex()) {
        headers.insert(DERP_PUBLIC_KEY, key);
    }

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let stream = Box::new(TokioIo::new(upgraded));
                server
                    .accept(RelaySession::new(stream, remote, Transport::Binary))
                    .await;
            }
            Err(e) => tracing::debug!("Relay upgrade from {} failed: {}", remote, e),
        }
    });

    (StatusCode::SWITCHING_PROTOCOLS, headers, Body::empty()).into_response()
}

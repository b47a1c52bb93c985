//! Reachability probes used by clients and captive-portal detection.

use axum::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};

/// Request header carrying a captive-portal challenge.
pub const CHALLENGE_HEADER: HeaderName = HeaderName::from_static("x-tailscale-challenge");

/// Response header echoing an accepted challenge.
pub const RESPONSE_HEADER: HeaderName = HeaderName::from_static("x-tailscale-response");

const MAX_CHALLENGE_LEN: usize = 64;

/// Handler for `/derp/probe` and `/derp/latency-check`.
pub async fn probe_handler(method: Method) -> Response {
    if method == Method::GET || method == Method::HEAD {
        ([(ACCESS_CONTROL_ALLOW_ORIGIN, "*")], StatusCode::OK).into_response()
    } else {
        (StatusCode::METHOD_NOT_ALLOWED, "bogus probe method").into_response()
    }
}

fn is_challenge_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'.' | b'-' | b'_' | b':')
}

/// Handler for `/generate_204`.
pub async fn generate_204_handler(headers: HeaderMap) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let challenge = headers
        .get(CHALLENGE_HEADER)
        .map(HeaderValue::as_bytes)
        .unwrap_or_default();
    if !challenge.is_empty()
        && challenge.len() <= MAX_CHALLENGE_LEN
        && challenge.iter().copied().all(is_challenge_char)
    {
        let mut echoed = b"response ".to_vec();
        echoed.extend_from_slice(challenge);
        if let Ok(value) = HeaderValue::from_bytes(&echoed) {
            response.headers_mut().insert(RESPONSE_HEADER, value);
        }
    }
    response.headers_mut().insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate, no-transform, max-age=0"),
    );
    response
}

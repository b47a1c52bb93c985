//! Home page, robots.txt and browser hardening headers.

use crate::config::ConfigError;
use axum::http::header::{
    CONTENT_SECURITY_POLICY, CONTENT_TYPE, LOCATION, STRICT_TRANSPORT_SECURITY,
    X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use std::sync::Arc;

/// Headers added to every response a browser might render.
const BROWSER_HEADERS: [(HeaderName, &str); 4] = [
    (
        STRICT_TRANSPORT_SECURITY,
        "max-age=63072000; includeSubDomains",
    ),
    (
        CONTENT_SECURITY_POLICY,
        "default-src 'self'; frame-ancestors 'none'; form-action 'self'; \
         base-uri 'self'; block-all-mixed-content; object-src 'none'",
    ),
    (X_FRAME_OPTIONS, "DENY"),
    (X_CONTENT_TYPE_OPTIONS, "nosniff"),
];

const DEFAULT_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>DERP</title></head>
<body>
<h1>DERP</h1>
<p>
  This is a DERP relay. It answers STUN binding requests and relays
  end-to-end encrypted traffic between mesh clients that cannot reach
  each other directly.
</p>
</body>
</html>
"#;

/// What `/` serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HomePage {
    /// The built-in page.
    Default,
    /// An empty HTML response.
    Blank,
    /// A 302 redirect to the given URL.
    Redirect(HeaderValue),
}

impl HomePage {
    /// Parse the `home` setting: empty, `blank`, or an `http://`/`https://` URL.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "" => Ok(Self::Default),
            "blank" => Ok(Self::Blank),
            url if url.starts_with("http://") || url.starts_with("https://") => {
                HeaderValue::from_str(url)
                    .map(Self::Redirect)
                    .map_err(|_| ConfigError::InvalidHome(value.to_string()))
            }
            _ => Err(ConfigError::InvalidHome(value.to_string())),
        }
    }
}

/// Add the browser hardening headers to `response`.
pub fn with_browser_headers(response: impl IntoResponse) -> Response {
    let mut response = response.into_response();
    let headers = response.headers_mut();
    for (name, value) in BROWSER_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    response
}

const HTML: (HeaderName, &str) = (CONTENT_TYPE, "text/html; charset=utf-8");

/// Handler for `/` and every unmatched path.
pub async fn home_handler(Extension(home): Extension<Arc<HomePage>>) -> Response {
    let response = match home.as_ref() {
        HomePage::Default => ([HTML], DEFAULT_PAGE).into_response(),
        HomePage::Blank => ([HTML], "").into_response(),
        HomePage::Redirect(url) => (StatusCode::FOUND, [(LOCATION, url.clone())]).into_response(),
    };
    with_browser_headers(response)
}

/// Handler for `/robots.txt`: disallow all crawling.
pub async fn robots_handler() -> Response {
    with_browser_headers("User-agent: *\nDisallow: /\n")
}

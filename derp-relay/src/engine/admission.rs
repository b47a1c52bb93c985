//! Client admission callbacks.
//!
//! When verification URLs are configured, every connecting client is checked
//! against each of them before it may use the relay:
//!
//! ```text
//! POST <url>
//! {"NodePublic":"nodekey:<hex>","Source":"<ip>"}
//!
//! 200 OK
//! {"Allow":true}
//! ```
//!
//! Requests dial through the inbound's [`Dialer`] rather than the default
//! network stack.

use crate::dialer::Dialer;
use crate::engine::RelayStream;
use crate::tls::{self, TlsError, ALPN_HTTP1};
use bytes::Bytes;
use derp_types::NodePublic;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::CONTENT_TYPE;
use hyper::{Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_rustls::TlsConnector;

/// How long one admission request may take.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest admission response body accepted.
pub const MAX_RESPONSE_BYTES: usize = 4 << 10;

/// Admission failures. Every variant denies the client.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// The configured URL is not usable.
    #[error("invalid verify_client_url {url}: {reason}")]
    InvalidUrl {
        /// The URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The request could not be completed.
    #[error("admission request to {url} failed: {reason}")]
    Request {
        /// The URL.
        url: String,
        /// Client error text.
        reason: String,
    },
    /// No answer within [`REQUEST_TIMEOUT`].
    #[error("admission request to {url} timed out")]
    Timeout {
        /// The URL.
        url: String,
    },
    /// The endpoint answered with a non-200 status.
    #[error("admission request to {url} returned status {status}")]
    Status {
        /// The URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// The response body was too large or not the expected JSON.
    #[error("bad admission response from {url}: {reason}")]
    Body {
        /// The URL.
        url: String,
        /// What was wrong.
        reason: String,
    },
    /// The endpoint answered `Allow: false`.
    #[error("client {key} denied by {url}")]
    Denied {
        /// The URL.
        url: String,
        /// The denied client.
        key: NodePublic,
    },
}

#[derive(Serialize)]
struct AdmissionRequest {
    #[serde(rename = "NodePublic")]
    node_public: NodePublic,
    #[serde(rename = "Source")]
    source: IpAddr,
}

#[derive(Deserialize)]
struct AdmissionResponse {
    #[serde(rename = "Allow")]
    allow: bool,
}

/// Checks connecting clients against the configured verification URLs.
pub struct ClientAdmission {
    urls: Vec<String>,
    client: Client<DialerConnector, Full<Bytes>>,
    timeout: Duration,
}

impl std::fmt::Debug for ClientAdmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAdmission")
            .field("urls", &self.urls)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ClientAdmission {
    /// Create an admission checker dialing through `dialer`.
    pub fn new(urls: Vec<String>, dialer: Arc<dyn Dialer>) -> Result<Self, TlsError> {
        let connector = DialerConnector {
            dialer,
            tls: tls::default_client_config(&[ALPN_HTTP1])?,
        };
        Ok(Self {
            urls,
            client: Client::builder(TokioExecutor::new()).build(connector),
            timeout: REQUEST_TIMEOUT,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether any verification URL is configured.
    pub fn is_enabled(&self) -> bool {
        !self.urls.is_empty()
    }

    /// Admit `key` connecting from `source` only if every URL allows it.
    pub async fn verify(&self, key: NodePublic, source: IpAddr) -> Result<(), AdmissionError> {
        for url in &self.urls {
            self.verify_one(url, key, source).await?;
        }
        Ok(())
    }

    async fn verify_one(
        &self,
        url: &str,
        key: NodePublic,
        source: IpAddr,
    ) -> Result<(), AdmissionError> {
        let body = serde_json::to_vec(&AdmissionRequest {
            node_public: key,
            source,
        })
        .map_err(|e| AdmissionError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let request = Request::post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| AdmissionError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let allow = tokio::time::timeout(self.timeout, self.exchange(url, request))
            .await
            .map_err(|_| AdmissionError::Timeout {
                url: url.to_string(),
            })??;

        if !allow {
            tracing::debug!("Client {} denied by {}", key, url);
            return Err(AdmissionError::Denied {
                url: url.to_string(),
                key,
            });
        }
        Ok(())
    }

    async fn exchange(&self, url: &str, request: Request<Full<Bytes>>) -> Result<bool, AdmissionError> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| AdmissionError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if response.status() != StatusCode::OK {
            return Err(AdmissionError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = Limited::new(response.into_body(), MAX_RESPONSE_BYTES)
            .collect()
            .await
            .map_err(|e| AdmissionError::Body {
                url: url.to_string(),
                reason: e.to_string(),
            })?
            .to_bytes();
        let parsed: AdmissionResponse =
            serde_json::from_slice(&body).map_err(|e| AdmissionError::Body {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(parsed.allow)
    }
}

/// Opens admission connections through a [`Dialer`], adding TLS for `https`.
#[derive(Clone)]
struct DialerConnector {
    dialer: Arc<dyn Dialer>,
    tls: Arc<ClientConfig>,
}

impl DialerConnector {
    async fn connect(self, uri: Uri) -> io::Result<DialedConnection> {
        let https = uri.scheme_str() == Some("https");
        let host = uri
            .host()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "URL has no host"))?;
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let tcp = self.dialer.dial(host, port).await?;
        let stream: Box<dyn RelayStream> = if https {
            let name = tls::server_name(host)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            Box::new(TlsConnector::from(self.tls).connect(name, tcp).await?)
        } else {
            Box::new(tcp)
        };
        Ok(DialedConnection(TokioIo::new(stream)))
    }
}

impl tower::Service<Uri> for DialerConnector {
    type Response = DialedConnection;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<DialedConnection>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect(uri))
    }
}

struct DialedConnection(TokioIo<Box<dyn RelayStream>>);

impl Connection for DialedConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for DialedConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.get_mut().0), cx, buf)
    }
}

impl hyper::rt::Write for DialedConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.get_mut().0), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.get_mut().0), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.get_mut().0), cx)
    }
}

//! Per-connection request service for the relay listener.
//!
//! Every request is tagged with the client address before routing. An
//! HTTP/1.1 request asking for `Upgrade: h2c` is answered with
//! `101 Switching Protocols` and the connection continues as HTTP/2 against
//! the same router. The upgrading request is served as stream 1: after the
//! client's connection preface its headers are replayed to the HTTP/2 server
//! as a HEADERS frame of HPACK literals, which leave both dynamic tables
//! untouched.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, Version};
use axum::response::Response;
use axum::Router;
use bytes::{BufMut, Bytes, BytesMut};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::util::ServiceExt;

/// Header carrying the client's SETTINGS payload on an h2c upgrade.
pub const HTTP2_SETTINGS: HeaderName = HeaderName::from_static("http2-settings");

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const FRAME_HEADER_LEN: usize = 9;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

/// Initial SETTINGS_MAX_FRAME_SIZE; bounds both the client's first SETTINGS
/// frame and the replayed header block.
const MAX_FRAME_LEN: usize = 16_384;

const PREFACE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection-specific headers, which HTTP/2 forbids.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "upgrade",
    "http2-settings",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
];

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// hyper service for one accepted connection.
#[derive(Clone)]
pub struct ConnectionService {
    router: Router,
    remote: SocketAddr,
    upgrades: Option<UpgradeTasks>,
}

#[derive(Clone)]
struct UpgradeTasks {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService")
            .field("remote", &self.remote)
            .field("h2c", &self.upgrades.is_some())
            .finish_non_exhaustive()
    }
}

impl ConnectionService {
    /// Route requests from `remote`. h2c sessions run on `tracker` until `cancel` fires.
    pub fn new(
        router: Router,
        remote: SocketAddr,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            router,
            remote,
            upgrades: Some(UpgradeTasks { tracker, cancel }),
        }
    }

    fn http2_session(&self) -> Self {
        Self {
            router: self.router.clone(),
            remote: self.remote,
            upgrades: None,
        }
    }
}

impl hyper::service::Service<Request<Incoming>> for ConnectionService {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn call(&self, mut request: Request<Incoming>) -> Self::Future {
        request.extensions_mut().insert(ConnectInfo(self.remote));

        if let Some(tasks) = &self.upgrades {
            if is_h2c_upgrade(&request) {
                if let Some(stream_one) =
                    stream_one_frame(request.method(), request.uri(), request.headers())
                {
                    let on_upgrade = hyper::upgrade::on(&mut request);
                    tasks.tracker.spawn(serve_h2c(
                        on_upgrade,
                        stream_one,
                        self.http2_session(),
                        tasks.cancel.clone(),
                    ));
                    return Box::pin(async { Ok(switching_to_h2c()) });
                }
                tracing::debug!("h2c upgrade from {} too large to replay", self.remote);
            }
        }

        Box::pin(self.router.clone().oneshot(request))
    }
}

/// Whether `request` asks to continue the connection as cleartext HTTP/2.
///
/// Requests with a body are served as HTTP/1.1.
pub fn is_h2c_upgrade<B>(request: &Request<B>) -> bool {
    let headers = request.headers();
    request.version() == Version::HTTP_11
        && has_token(headers, &UPGRADE, "h2c")
        && has_token(headers, &CONNECTION, "upgrade")
        && headers.contains_key(HTTP2_SETTINGS)
        && !has_body(headers)
}

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn has_body(headers: &HeaderMap) -> bool {
    headers.contains_key(TRANSFER_ENCODING)
        || headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() != "0")
}

fn switching_to_h2c() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static("h2c"));
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    response
}

/// Encode the upgrading request as a HEADERS frame on stream 1 that ends the stream.
///
/// `None` when the header block does not fit one frame.
fn stream_one_frame(method: &Method, uri: &Uri, headers: &HeaderMap) -> Option<Bytes> {
    let authority = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or_default();
    let path = uri.path_and_query().map_or("/", |p| p.as_str());

    let mut block = BytesMut::new();
    hpack_literal(&mut block, b":method", method.as_str().as_bytes());
    hpack_literal(&mut block, b":scheme", b"https");
    if !authority.is_empty() {
        hpack_literal(&mut block, b":authority", authority.as_bytes());
    }
    hpack_literal(&mut block, b":path", path.as_bytes());
    for (name, value) in headers {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            hpack_literal(&mut block, name.as_str().as_bytes(), value.as_bytes());
        }
    }
    if block.len() > MAX_FRAME_LEN {
        return None;
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + block.len());
    frame.put_uint(block.len() as u64, 3);
    frame.put_u8(FRAME_HEADERS);
    frame.put_u8(FLAG_END_STREAM | FLAG_END_HEADERS);
    frame.put_u32(1);
    frame.extend_from_slice(&block);
    Some(frame.freeze())
}

/// Literal header field without indexing, new name, no Huffman coding.
fn hpack_literal(block: &mut BytesMut, name: &[u8], value: &[u8]) {
    block.put_u8(0x00);
    hpack_string(block, name);
    hpack_string(block, value);
}

fn hpack_string(block: &mut BytesMut, s: &[u8]) {
    hpack_integer(block, s.len(), 7);
    block.extend_from_slice(s);
}

fn hpack_integer(block: &mut BytesMut, value: usize, prefix_bits: u8) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        block.put_u8(value as u8);
        return;
    }
    block.put_u8(max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        block.put_u8((rest & 0x7f) as u8 | 0x80);
        rest >>= 7;
    }
    block.put_u8(rest as u8);
}

/// Read the client connection preface and its mandatory first SETTINGS frame.
async fn read_client_preface<S: AsyncRead + Unpin>(io: &mut S) -> io::Result<Vec<u8>> {
    let mut preface = vec![0u8; PREFACE.len() + FRAME_HEADER_LEN];
    io.read_exact(&mut preface).await?;
    if &preface[..PREFACE.len()] != PREFACE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing HTTP/2 client preface",
        ));
    }
    let header = &preface[PREFACE.len()..];
    let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    if header[3] != FRAME_SETTINGS || len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected SETTINGS after the client preface",
        ));
    }
    let start = preface.len();
    preface.resize(start + len, 0);
    io.read_exact(&mut preface[start..]).await?;
    Ok(preface)
}

async fn serve_h2c(
    on_upgrade: OnUpgrade,
    stream_one: Bytes,
    service: ConnectionService,
    cancel: CancellationToken,
) {
    let remote = service.remote;
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = run_h2c(on_upgrade, stream_one, service) => {
            if let Err(e) = result {
                tracing::debug!("h2c session with {} ended: {}", remote, e);
            }
        }
    }
}

async fn run_h2c(
    on_upgrade: OnUpgrade,
    stream_one: Bytes,
    service: ConnectionService,
) -> Result<(), BoxError> {
    let mut io = TokioIo::new(on_upgrade.await?);
    let preface = tokio::time::timeout(PREFACE_TIMEOUT, read_client_preface(&mut io)).await??;

    let mut prefix = BytesMut::with_capacity(preface.len() + stream_one.len());
    prefix.extend_from_slice(&preface);
    prefix.extend_from_slice(&stream_one);
    let io = Prefixed {
        prefix: prefix.freeze(),
        inner: io,
    };

    hyper::server::conn::http2::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await?;
    Ok(())
}

/// A stream that yields `prefix` before reading from `inner`.
struct Prefixed<S> {
    prefix: Bytes,
    inner: S,
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use hyper_util::server::conn::auto;
    use tokio::io::{AsyncWrite, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// An h2c upgrade request for `path`, as raw HTTP/1.1.
    fn h2c_request(path: &str) -> String {
        format!(
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade, HTTP2-Settings\r\n\
             Upgrade: h2c\r\nHTTP2-Settings: AAMAAABkAARAAAAAAAIAAAAA\r\n\r\n"
        )
    }

    /// Send the HTTP/2 client preface with empty SETTINGS, then return the
    /// first frame byte of the response HEADERS on stream 1.
    async fn stream_one_status<S>(stream: &mut S) -> u8
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(PREFACE).await.unwrap();
        stream.write_all(&[0, 0, 0, FRAME_SETTINGS, 0, 0, 0, 0, 0]).await.unwrap();
        loop {
            let mut header = [0u8; FRAME_HEADER_LEN];
            stream.read_exact(&mut header).await.unwrap();
            let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
            let stream_id = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await.unwrap();

            if header[3] == FRAME_SETTINGS && header[4] == 0 {
                stream.write_all(&[0, 0, 0, FRAME_SETTINGS, 1, 0, 0, 0, 0]).await.unwrap();
            }
            if header[3] == FRAME_HEADERS && stream_id == 1 {
                return payload[0];
            }
        }
    }

    /// Read an HTTP/1.1 response head byte by byte.
    async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(stream.read_u8().await.unwrap());
        }
        String::from_utf8(head).unwrap()
    }

    /// Indexed `:status 200` in the HPACK static table.
    const STATUS_200: u8 = 0x88;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri("/derp/probe");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    const UPGRADE_HEADERS: [(&str, &str); 3] = [
        ("connection", "Upgrade, HTTP2-Settings"),
        ("upgrade", "h2c"),
        ("http2-settings", "AAMAAABkAARAAAAAAAIAAAAA"),
    ];

    #[test]
    fn detects_h2c_upgrade() {
        assert!(is_h2c_upgrade(&request(&UPGRADE_HEADERS)));
        assert!(is_h2c_upgrade(&request(&[
            ("connection", "keep-alive, upgrade, http2-settings"),
            ("upgrade", "H2C"),
            ("http2-settings", ""),
        ])));
    }

    #[test]
    fn incomplete_or_bodied_upgrade_is_plain_http1() {
        assert!(!is_h2c_upgrade(&request(&UPGRADE_HEADERS[..2])));
        assert!(!is_h2c_upgrade(&request(&[
            ("upgrade", "h2c"),
            ("http2-settings", "AAMAAABkAARAAAAAAAIAAAAA"),
        ])));
        assert!(!is_h2c_upgrade(&request(&[
            ("connection", "Upgrade"),
            ("upgrade", "DERP"),
            ("http2-settings", "AAMAAABkAARAAAAAAAIAAAAA"),
        ])));

        let mut with_body = request(&UPGRADE_HEADERS);
        with_body
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        assert!(!is_h2c_upgrade(&with_body));

        let mut http10 = request(&UPGRADE_HEADERS);
        *http10.version_mut() = Version::HTTP_10;
        assert!(!is_h2c_upgrade(&http10));
    }

    #[test]
    fn stream_one_frame_replays_request_as_literals() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("a"));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert("x-k", HeaderValue::from_static("v"));

        let frame = stream_one_frame(&Method::GET, &Uri::from_static("/p"), &headers).unwrap();

        let mut expected = Vec::new();
        for (name, value) in [
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "a"),
            (":path", "/p"),
            ("x-k", "v"),
        ] {
            expected.push(0x00);
            expected.push(name.len() as u8);
            expected.extend_from_slice(name.as_bytes());
            expected.push(value.len() as u8);
            expected.extend_from_slice(value.as_bytes());
        }

        assert_eq!(&frame[..3], &[0, 0, expected.len() as u8]);
        assert_eq!(frame[3], FRAME_HEADERS);
        assert_eq!(frame[4], FLAG_END_STREAM | FLAG_END_HEADERS);
        assert_eq!(&frame[5..9], &[0, 0, 0, 1]);
        assert_eq!(&frame[9..], &expected[..]);
    }

    #[test]
    fn oversized_header_block_is_not_replayed() {
        let mut headers = HeaderMap::new();
        let big = "v".repeat(MAX_FRAME_LEN + 1);
        headers.insert("x-big", HeaderValue::from_str(&big).unwrap());
        assert!(stream_one_frame(&Method::GET, &Uri::from_static("/"), &headers).is_none());
    }

    #[test]
    fn hpack_integer_uses_continuation_bytes() {
        let mut block = BytesMut::new();
        hpack_integer(&mut block, 10, 7);
        assert_eq!(&block[..], &[10]);

        // RFC 7541 C.1.2 with a 5-bit prefix: 1337 -> 1f 9a 0a.
        let mut block = BytesMut::new();
        hpack_integer(&mut block, 1337, 5);
        assert_eq!(&block[..], &[0x1f, 0x9a, 0x0a]);
    }

    #[tokio::test]
    async fn prefixed_stream_reads_prefix_first() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = Prefixed {
            prefix: Bytes::from_static(b"head-"),
            inner: client,
        };
        server.write_all(b"tail").await.unwrap();
        drop(server);

        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"head-tail");
    }

    async fn serve(router: Router) -> (SocketAddr, TaskTracker, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let (t, c) = (tracker.clone(), cancel.clone());
        tokio::spawn(async move {
            loop {
                let (tcp, remote) = listener.accept().await.unwrap();
                let service = ConnectionService::new(router.clone(), remote, t.clone(), c.clone());
                tokio::spawn(async move {
                    let _ = auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(TokioIo::new(tcp), service)
                        .await;
                });
            }
        });
        (addr, tracker, cancel)
    }

    async fn echo_remote(ConnectInfo(remote): ConnectInfo<SocketAddr>) -> String {
        remote.to_string()
    }

    #[tokio::test]
    async fn requests_carry_remote_address() {
        let (addr, _tracker, _cancel) = serve(Router::new().route("/", get(echo_remote))).await;
        let mut tcp = TcpStream::connect(addr).await.unwrap();
        tcp.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        tcp.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with(&tcp.local_addr().unwrap().to_string()));
    }

    #[tokio::test]
    async fn h2c_upgrade_serves_upgrading_request_on_stream_one() {
        let (addr, tracker, cancel) = serve(Router::new().route("/ok", get(|| async { "ok" }))).await;
        let mut tcp = TcpStream::connect(addr).await.unwrap();
        tcp.write_all(h2c_request("/ok").as_bytes()).await.unwrap();

        let head = read_head(&mut tcp).await.to_ascii_lowercase();
        assert!(head.starts_with("http/1.1 101"), "unexpected response: {head}");
        assert!(head.contains("upgrade: h2c"));

        let status = tokio::time::timeout(Duration::from_secs(5), stream_one_status(&mut tcp))
            .await
            .unwrap();
        assert_eq!(status, STATUS_200);

        cancel.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .unwrap();
    }
}

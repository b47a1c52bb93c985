//! TLS termination for the inbound listener and client configs for outbound TLS.
//!
//! Both sides use rustls with the ring provider.

use crate::config::{InboundTlsConfig, OutboundTlsConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_rustls::TlsAcceptor;

/// ALPN identifier for HTTP/2 over TLS.
pub const ALPN_H2: &str = "h2";
/// ALPN identifier for HTTP/1.1.
pub const ALPN_HTTP1: &str = "http/1.1";

/// TLS errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// Reading a PEM file failed.
    #[error("failed to read {path}: {source}")]
    Read {
        /// The PEM file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The certificate file holds no certificates.
    #[error("no certificates in {0}")]
    NoCertificates(PathBuf),
    /// The key file holds no private key.
    #[error("no private key in {0}")]
    NoPrivateKey(PathBuf),
    /// rustls rejected the configuration.
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    /// The name is not usable for server verification.
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),
    /// The termination resource has not been started, or was closed.
    #[error("TLS termination not started")]
    NotStarted,
}

struct TerminationState {
    base: Option<ServerConfig>,
    next_protocols: Vec<String>,
    current: Option<Arc<ServerConfig>>,
}

/// Server-side TLS termination resource.
///
/// Certificates load on [`start`](Self::start); ALPN can be adjusted
/// afterwards and applies to acceptors created from then on.
pub struct TlsTermination {
    certificate_path: PathBuf,
    key_path: PathBuf,
    state: Mutex<TerminationState>,
}

impl std::fmt::Debug for TlsTermination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTermination")
            .field("certificate_path", &self.certificate_path)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl TlsTermination {
    /// Create an unstarted termination resource.
    pub fn new(config: &InboundTlsConfig) -> Self {
        Self {
            certificate_path: config.certificate_path.clone(),
            key_path: config.key_path.clone(),
            state: Mutex::new(TerminationState {
                base: None,
                next_protocols: config.alpn.clone(),
                current: None,
            }),
        }
    }

    /// Load the certificate chain and key.
    pub fn start(&self) -> Result<(), TlsError> {
        let certs = load_certs(&self.certificate_path)?;
        let key = load_key(&self.key_path)?;
        let base = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        let mut state = self.lock();
        state.current = Some(Arc::new(with_alpn(&base, &state.next_protocols)));
        state.base = Some(base);
        Ok(())
    }

    /// The ALPN protocols currently offered.
    pub fn next_protocols(&self) -> Vec<String> {
        self.lock().next_protocols.clone()
    }

    /// Replace the ALPN protocol list.
    pub fn set_next_protocols(&self, protocols: Vec<String>) {
        let mut state = self.lock();
        if let Some(base) = &state.base {
            state.current = Some(Arc::new(with_alpn(base, &protocols)));
        }
        state.next_protocols = protocols;
    }

    /// An acceptor for the current configuration.
    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        self.lock()
            .current
            .clone()
            .map(TlsAcceptor::from)
            .ok_or(TlsError::NotStarted)
    }

    /// Drop the loaded key material. Idempotent.
    pub fn close(&self) -> Result<(), TlsError> {
        let mut state = self.lock();
        state.base = None;
        state.current = None;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TerminationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Make sure `h2` is offered so HTTP/2 works over the one listener.
///
/// An empty list becomes `h2, http/1.1`; a custom list without `h2` gets it prepended.
pub fn ensure_h2(protocols: Vec<String>) -> Vec<String> {
    if protocols.is_empty() {
        return vec![ALPN_H2.to_string(), ALPN_HTTP1.to_string()];
    }
    if protocols.iter().any(|p| p == ALPN_H2) {
        return protocols;
    }
    let mut with_h2 = Vec::with_capacity(protocols.len() + 1);
    with_h2.push(ALPN_H2.to_string());
    with_h2.extend(protocols);
    with_h2
}

/// A client TLS configuration bound to the name it verifies.
#[derive(Clone)]
pub struct ClientTls {
    /// rustls client configuration.
    pub config: Arc<ClientConfig>,
    /// Name sent as SNI and verified against the certificate.
    pub server_name: ServerName<'static>,
}

impl std::fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .field("alpn", &self.config.alpn_protocols.len())
            .finish()
    }
}

/// Build a client TLS configuration for `hostname`.
pub fn client_config(hostname: &str, options: &OutboundTlsConfig) -> Result<ClientTls, TlsError> {
    let mut roots = web_pki_roots();
    if let Some(path) = &options.certificate_path {
        for cert in load_certs(path)? {
            roots.add(cert)?;
        }
    }
    let alpn: Vec<&str> = options.alpn.iter().map(String::as_str).collect();
    let config = client_config_with_roots(roots, &alpn)?;

    let name = options
        .server_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .unwrap_or(hostname);
    Ok(ClientTls {
        config,
        server_name: server_name(name)?,
    })
}

/// Client configuration trusting the web PKI roots.
pub(crate) fn default_client_config(alpn: &[&str]) -> Result<Arc<ClientConfig>, TlsError> {
    client_config_with_roots(web_pki_roots(), alpn)
}

/// Parse a DNS name or IP literal for verification.
pub(crate) fn server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    let bare = name.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(bare.to_string()).map_err(|_| TlsError::InvalidServerName(name.to_string()))
}

fn client_config_with_roots(
    roots: RootCertStore,
    alpn: &[&str],
) -> Result<Arc<ClientConfig>, TlsError> {
    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(Arc::new(config))
}

fn web_pki_roots() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn with_alpn(base: &ServerConfig, protocols: &[String]) -> ServerConfig {
    let mut config = base.clone();
    config.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    config
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|e| TlsError::Read {
        path: path.to_path_buf(),
        source: e,
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_pem(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_pem(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TlsError::Read {
            path: path.to_path_buf(),
            source: e,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a self-signed `localhost` certificate and key into `dir`.
    pub(crate) fn write_self_signed(dir: &Path) -> InboundTlsConfig {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let certificate_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&certificate_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
        InboundTlsConfig {
            enabled: true,
            certificate_path,
            key_path,
            alpn: Vec::new(),
        }
    }

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ensure_h2_defaults_when_unset() {
        assert_eq!(ensure_h2(Vec::new()), strings(&["h2", "http/1.1"]));
    }

    #[test]
    fn ensure_h2_prepends_when_missing() {
        assert_eq!(
            ensure_h2(strings(&["http/1.1"])),
            strings(&["h2", "http/1.1"])
        );
    }

    #[test]
    fn ensure_h2_keeps_existing_order() {
        assert_eq!(
            ensure_h2(strings(&["http/1.1", "h2"])),
            strings(&["http/1.1", "h2"])
        );
    }

    #[test]
    fn start_loads_certificate_and_applies_alpn() {
        let dir = tempfile::tempdir().unwrap();
        let tls = TlsTermination::new(&write_self_signed(dir.path()));
        assert!(matches!(tls.acceptor(), Err(TlsError::NotStarted)));

        tls.start().unwrap();
        tls.set_next_protocols(ensure_h2(tls.next_protocols()));
        assert_eq!(tls.next_protocols(), strings(&["h2", "http/1.1"]));

        let acceptor = tls.acceptor().unwrap();
        assert_eq!(
            acceptor.config().alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn close_is_idempotent_and_drops_config() {
        let dir = tempfile::tempdir().unwrap();
        let tls = TlsTermination::new(&write_self_signed(dir.path()));
        tls.start().unwrap();

        tls.close().unwrap();
        tls.close().unwrap();
        assert!(matches!(tls.acceptor(), Err(TlsError::NotStarted)));
    }

    #[test]
    fn missing_certificate_fails_start() {
        let tls = TlsTermination::new(&InboundTlsConfig {
            enabled: true,
            certificate_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
            alpn: Vec::new(),
        });
        assert!(matches!(tls.start(), Err(TlsError::Read { .. })));
    }

    #[test]
    fn empty_certificate_file_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_self_signed(dir.path());
        config.certificate_path = dir.path().join("empty.pem");
        std::fs::write(&config.certificate_path, "").unwrap();

        let tls = TlsTermination::new(&config);
        assert!(matches!(tls.start(), Err(TlsError::NoCertificates(_))));
    }

    #[test]
    fn client_config_uses_override_name() {
        let options = OutboundTlsConfig {
            enabled: true,
            server_name: Some("relay.internal".into()),
            alpn: strings(&["http/1.1"]),
            certificate_path: None,
        };
        let tls = client_config("derp2.example.com", &options).unwrap();
        assert_eq!(tls.server_name, ServerName::try_from("relay.internal").unwrap());
        assert_eq!(tls.config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn client_config_trusts_extra_ca() {
        let dir = tempfile::tempdir().unwrap();
        let server = write_self_signed(dir.path());
        let options = OutboundTlsConfig {
            enabled: true,
            certificate_path: Some(server.certificate_path),
            ..OutboundTlsConfig::default()
        };
        let tls = client_config("localhost", &options).unwrap();
        assert_eq!(tls.server_name, ServerName::try_from("localhost").unwrap());
    }

    #[test]
    fn client_config_accepts_ip_literal() {
        let tls = client_config("[2001:db8::1]", &OutboundTlsConfig::default()).unwrap();
        assert!(matches!(tls.server_name, ServerName::IpAddress(_)));
    }

    #[test]
    fn client_config_rejects_bad_name() {
        let err = client_config("not a hostname!", &OutboundTlsConfig::default()).unwrap_err();
        assert!(matches!(err, TlsError::InvalidServerName(_)));
    }
}

//! Configuration for the relay inbound.
//!
//! The host deserializes an [`InboundConfig`] from TOML (see
//! [`InboundConfig::from_file`]); construction of the inbound validates it.

use derp_types::MeshKeyError;
use serde::{Deserialize, Deserializer};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

/// Root configuration for a relay inbound.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundConfig {
    /// Listen address for the HTTP/TLS listener and the STUN socket (default: 0.0.0.0).
    #[serde(default = "default_listen")]
    pub listen: IpAddr,
    /// TCP port for the HTTP/TLS listener (default: 443).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// UDP port for the STUN responder; 0 disables STUN.
    #[serde(default)]
    pub stun_port: u16,
    /// TLS server configuration. Required, and must be enabled.
    #[serde(default)]
    pub tls: Option<InboundTlsConfig>,
    /// Path of the node identity key file.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// Client admission URLs (a single string or a list).
    #[serde(default, deserialize_with = "one_or_many")]
    pub verify_client_url: Vec<String>,
    /// Peer relays to mesh with.
    #[serde(default)]
    pub mesh_with: Vec<MeshPeerConfig>,
    /// Inline mesh pre-shared key.
    #[serde(default)]
    pub mesh_psk: Option<String>,
    /// File holding the mesh pre-shared key.
    #[serde(default)]
    pub mesh_psk_file: Option<PathBuf>,
    /// Home page: empty for the default page, `blank`, or an http(s) URL to redirect to.
    #[serde(default)]
    pub home: String,
    /// Outbound dialer used for client admission requests and bootstrap DNS.
    #[serde(default)]
    pub dialer: DialerConfig,
}

/// Inbound TLS termination settings.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundTlsConfig {
    /// Must be true; the relay refuses to run without TLS.
    #[serde(default)]
    pub enabled: bool,
    /// PEM certificate chain.
    pub certificate_path: PathBuf,
    /// PEM private key.
    pub key_path: PathBuf,
    /// ALPN protocols; `h2` is prepended when missing, empty means `h2, http/1.1`.
    #[serde(default)]
    pub alpn: Vec<String>,
}

/// Outbound TLS settings for a mesh peer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboundTlsConfig {
    /// Enable explicit TLS settings for this peer.
    #[serde(default)]
    pub enabled: bool,
    /// SNI / verification name, if different from the peer hostname.
    #[serde(default)]
    pub server_name: Option<String>,
    /// ALPN protocols offered to the peer.
    #[serde(default)]
    pub alpn: Vec<String>,
    /// Extra PEM CA certificates trusted for this peer, in addition to the web PKI roots.
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,
}

/// How hostnames resolve to addresses when dialing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStrategy {
    /// Use addresses in resolver order.
    #[default]
    AsIs,
    /// IPv4 addresses first.
    PreferIpv4,
    /// IPv6 addresses first.
    PreferIpv6,
    /// Only IPv4 addresses.
    Ipv4Only,
    /// Only IPv6 addresses.
    Ipv6Only,
}

/// Outbound dialer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DialerConfig {
    /// Local address to bind outbound sockets to.
    #[serde(default)]
    pub bind_address: Option<IpAddr>,
    /// TCP connect timeout in seconds (default: 5).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Address family preference for hostname targets.
    #[serde(default)]
    pub domain_strategy: DomainStrategy,
}

/// A peer relay to mesh with.
#[derive(Debug, Clone, Deserialize)]
pub struct MeshPeerConfig {
    /// Peer server address (hostname or IP).
    pub server: String,
    /// Peer server port (default: 443).
    #[serde(default = "default_listen_port")]
    pub server_port: u16,
    /// Hostname override used for TLS and logging.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Dialer used for this peer only.
    #[serde(default)]
    pub dialer: DialerConfig,
    /// Outbound TLS settings.
    #[serde(default)]
    pub tls: Option<OutboundTlsConfig>,
}

impl MeshPeerConfig {
    /// The peer's hostname: the explicit override, else the server address.
    pub fn hostname(&self) -> &str {
        match self.hostname.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.server,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        match self.server.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.server_port),
            _ => format!("{}:{}", self.server, self.server_port),
        }
    }

    /// The peer's relay upgrade endpoint.
    pub fn relay_url(&self) -> String {
        format!("https://{}/derp", self.authority())
    }

    /// Outbound TLS settings, if enabled.
    pub fn enabled_tls(&self) -> Option<&OutboundTlsConfig> {
        self.tls.as_ref().filter(|tls| tls.enabled)
    }
}

// Default value functions
fn default_listen() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_listen_port() -> u16 {
    443
}

fn default_connect_timeout() -> u64 {
    5
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            connect_timeout_secs: default_connect_timeout(),
            domain_strategy: DomainStrategy::default(),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) if url.is_empty() => Vec::new(),
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

impl InboundConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from a TOML document held in memory.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::InvalidToml)
    }

    /// The inline mesh key, treating an empty string as unset.
    pub fn inline_mesh_key(&self) -> Option<&str> {
        self.mesh_psk.as_deref().filter(|key| !key.is_empty())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// An in-memory TOML document failed to parse.
    #[error("failed to parse config: {0}")]
    InvalidToml(#[source] toml::de::Error),
    /// TLS block missing or disabled.
    #[error("TLS is required for DERP server")]
    TlsRequired,
    /// No key path and not running as root.
    #[error("missing config_path")]
    MissingConfigPath,
    /// Inline mesh key is malformed.
    #[error("invalid mesh_psk: {0}")]
    InvalidMeshKey(#[source] MeshKeyError),
    /// Mesh key file content is malformed.
    #[error("invalid mesh_psk_file {path}: {source}")]
    InvalidMeshKeyFile {
        /// The key file.
        path: PathBuf,
        /// Why the content was rejected.
        source: MeshKeyError,
    },
    /// Unrecognized home page value.
    #[error("invalid home value: {0}")]
    InvalidHome(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: InboundConfig = toml::from_str("").unwrap();
        assert_eq!(config.listen, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.listen_port, 443);
        assert_eq!(config.stun_port, 0);
        assert!(config.tls.is_none());
        assert!(config.verify_client_url.is_empty());
        assert!(config.mesh_with.is_empty());
        assert_eq!(config.dialer.connect_timeout_secs, 5);
        assert_eq!(config.dialer.domain_strategy, DomainStrategy::AsIs);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
listen = "127.0.0.1"
listen_port = 8443
stun_port = 3478
config_path = "/var/lib/derp/derp.key"
verify_client_url = ["https://a.example/verify", "https://b.example/verify"]
mesh_psk_file = "/etc/derp/mesh.key"
home = "blank"

[tls]
enabled = true
certificate_path = "/etc/derp/cert.pem"
key_path = "/etc/derp/key.pem"
alpn = ["http/1.1"]

[dialer]
bind_address = "10.0.0.2"
connect_timeout_secs = 3
domain_strategy = "prefer_ipv6"

[[mesh_with]]
server = "derp2.example.com"
hostname = "relay2.example.com"
[mesh_with.tls]
enabled = true
server_name = "relay2.internal"

[[mesh_with]]
server = "2001:db8::5"
server_port = 8443
"#;

        let config: InboundConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.listen_port, 8443);
        assert_eq!(config.stun_port, 3478);
        assert_eq!(config.verify_client_url.len(), 2);
        assert_eq!(config.home, "blank");
        let tls = config.tls.as_ref().unwrap();
        assert!(tls.enabled);
        assert_eq!(tls.alpn, vec!["http/1.1".to_string()]);
        assert_eq!(config.dialer.domain_strategy, DomainStrategy::PreferIpv6);
        assert_eq!(config.dialer.connect_timeout_secs, 3);

        let first = &config.mesh_with[0];
        assert_eq!(first.hostname(), "relay2.example.com");
        assert_eq!(first.relay_url(), "https://derp2.example.com:443/derp");
        assert_eq!(
            first.enabled_tls().unwrap().server_name.as_deref(),
            Some("relay2.internal")
        );

        let second = &config.mesh_with[1];
        assert_eq!(second.hostname(), "2001:db8::5");
        assert_eq!(second.relay_url(), "https://[2001:db8::5]:8443/derp");
        assert!(second.enabled_tls().is_none());
    }

    #[test]
    fn verify_client_url_accepts_single_string() {
        let config: InboundConfig =
            toml::from_str(r#"verify_client_url = "https://a.example/verify""#).unwrap();
        assert_eq!(config.verify_client_url, vec!["https://a.example/verify"]);

        let config: InboundConfig = toml::from_str(r#"verify_client_url = """#).unwrap();
        assert!(config.verify_client_url.is_empty());
    }

    #[test]
    fn empty_inline_mesh_key_is_unset() {
        let config: InboundConfig = toml::from_str(r#"mesh_psk = """#).unwrap();
        assert_eq!(config.inline_mesh_key(), None);
    }

    #[test]
    fn from_toml_str_reports_parse_error() {
        let config = InboundConfig::from_toml_str("stun_port = 3478").unwrap();
        assert_eq!(config.stun_port, 3478);

        let err = InboundConfig::from_toml_str("[[mesh_with]]\nserver_port = 1").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidToml(_)));
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = InboundConfig::from_file(Path::new("/nonexistent/derp.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn from_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("derp.toml");
        std::fs::write(&path, "listen_port = \"not a port\"").unwrap();
        let err = InboundConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}

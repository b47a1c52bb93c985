//! Error types for the relay inbound.

use crate::config::ConfigError;
use crate::inbound::InboundState;
use crate::keystore::KeyStoreError;
use crate::mesh::MeshError;
use crate::tls::TlsError;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Main error type for relay inbound operations.
#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Identity key store error.
    #[error("key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// TLS termination error.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Mesh federation setup error.
    #[error("mesh error: {0}")]
    Mesh(#[from] MeshError),

    /// Reading the mesh key file failed.
    #[error("failed to read mesh_psk_file {path}: {source}")]
    MeshKeyFile {
        /// The key file.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Mesh peers are configured but no mesh key is installed.
    #[error("missing mesh psk")]
    MissingMeshKey,

    /// Mesh peers are configured but the host supplied no mesh connector.
    #[error("mesh_with configured but no mesh connector available")]
    MissingMeshConnector,

    /// Binding a listener failed.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        /// The address being bound.
        addr: SocketAddr,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A lifecycle stage was invoked out of order.
    #[error("cannot {operation} inbound in state {state:?}")]
    InvalidState {
        /// The stage that was attempted.
        operation: &'static str,
        /// The state the inbound was in.
        state: InboundState,
    },

    /// A background task panicked or was aborted.
    #[error("background task {name} failed: {reason}")]
    Task {
        /// Which task.
        name: &'static str,
        /// Join error text.
        reason: String,
    },

    /// Several independent operations failed.
    #[error("{}", JoinedErrors(.0))]
    Multiple(Vec<InboundError>),
}

struct JoinedErrors<'a>(&'a [InboundError]);

impl fmt::Display for JoinedErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl InboundError {
    /// Collapse a list of errors: none is `Ok`, one is itself, more is [`InboundError::Multiple`].
    pub fn from_many(mut errors: Vec<InboundError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(InboundError::Multiple(errors)),
        }
    }
}

/// Reports whether an I/O error means the socket was closed or the operation canceled.
///
/// These are shutdown signals, not failures.
pub fn is_closed_or_canceled(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
    )
}

/// Reports whether an I/O error hit one operation but left the socket usable.
///
/// Accept and receive loops retry these at once, without a pause.
pub fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Result type alias for inbound operations.
pub type Result<T> = std::result::Result<T, InboundError>;

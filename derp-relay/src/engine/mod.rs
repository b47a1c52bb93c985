//! The shared relay engine handle.
//!
//! [`RelayServer`] owns what every task needs: the node identity, the mesh
//! key, client admission and the forwarder table. The per-connection DERP
//! state machine is not implemented here; sessions are handed to a
//! [`SessionHandler`] supplied by the host.

pub mod admission;
mod forwarder;

pub use admission::{AdmissionError, ClientAdmission};
pub use forwarder::ForwarderTable;

use async_trait::async_trait;
use bytes::Bytes;
use derp_types::{MeshKey, NodePrivate, NodePublic, PROTOCOL_VERSION};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, BufStream};

/// A bidirectional byte stream a relay session runs over.
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayStream for T {}

/// Which wire format a session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// DERP framing directly on the upgraded connection.
    Binary,
    /// DERP framing inside binary WebSocket messages.
    WebSocket,
}

/// One client connection, ready for the protocol engine.
pub struct RelaySession {
    /// Buffered reader/writer over the underlying stream. Dropping it closes the connection.
    pub stream: BufStream<Box<dyn RelayStream>>,
    /// The client's address.
    pub remote_addr: SocketAddr,
    /// Wire format the session arrived on.
    pub transport: Transport,
}

impl RelaySession {
    /// Wrap a stream for handoff.
    pub fn new(stream: Box<dyn RelayStream>, remote_addr: SocketAddr, transport: Transport) -> Self {
        Self {
            stream: BufStream::new(stream),
            remote_addr,
            transport,
        }
    }
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("remote_addr", &self.remote_addr)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// The per-connection DERP protocol engine.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Run a client session to completion.
    async fn accept(&self, server: Arc<RelayServer>, session: RelaySession);

    /// Protocol version advertised during the upgrade.
    fn protocol_version(&self) -> u32 {
        PROTOCOL_VERSION
    }
}

/// Delivers packets to a node reachable through another relay.
#[async_trait]
pub trait PacketForwarder: Send + Sync {
    /// Forward `packet` from `src` to `dst`.
    async fn forward_packet(&self, src: NodePublic, dst: NodePublic, packet: Bytes)
        -> io::Result<()>;
}

/// Shared relay engine handle.
pub struct RelayServer {
    private_key: NodePrivate,
    public_key: NodePublic,
    mesh_key: RwLock<Option<MeshKey>>,
    admission: ClientAdmission,
    forwarders: ForwarderTable,
    handler: Arc<dyn SessionHandler>,
    sessions_total: AtomicU64,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("public_key", &self.public_key)
            .field("has_mesh_key", &self.has_mesh_key())
            .field("admission", &self.admission)
            .field("forwarders", &self.forwarders)
            .finish_non_exhaustive()
    }
}

impl RelayServer {
    /// Create an engine bound to `private_key`.
    pub fn new(
        private_key: NodePrivate,
        admission: ClientAdmission,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        let public_key = private_key.public();
        Self {
            private_key,
            public_key,
            mesh_key: RwLock::new(None),
            admission,
            forwarders: ForwarderTable::new(),
            handler,
            sessions_total: AtomicU64::new(0),
        }
    }

    /// This node's private key.
    pub fn private_key(&self) -> &NodePrivate {
        &self.private_key
    }

    /// This node's public key.
    pub fn public_key(&self) -> NodePublic {
        self.public_key
    }

    /// Protocol version advertised to clients.
    pub fn protocol_version(&self) -> u32 {
        self.handler.protocol_version()
    }

    /// Install the mesh key. Only validated keys can be constructed.
    pub fn set_mesh_key(&self, key: MeshKey) {
        *self.mesh_key.write().unwrap_or_else(PoisonError::into_inner) = Some(key);
    }

    /// Whether a mesh key is installed.
    pub fn has_mesh_key(&self) -> bool {
        self.mesh_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The installed mesh key.
    pub fn mesh_key(&self) -> Option<MeshKey> {
        self.mesh_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hand an established session to the protocol engine.
    pub async fn accept(self: Arc<Self>, session: RelaySession) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Accepted {:?} session from {}",
            session.transport,
            session.remote_addr
        );
        let handler = self.handler.clone();
        handler.accept(self, session).await;
    }

    /// Sessions handed to the engine so far.
    pub fn sessions_total(&self) -> u64 {
        self.sessions_total.load(Ordering::Relaxed)
    }

    /// Register `forwarder` as able to reach `key`.
    pub fn add_packet_forwarder(&self, key: NodePublic, forwarder: Arc<dyn PacketForwarder>) {
        self.forwarders.add(key, forwarder);
    }

    /// Remove exactly the registration of `forwarder` for `key`.
    pub fn remove_packet_forwarder(&self, key: &NodePublic, forwarder: &Arc<dyn PacketForwarder>) {
        self.forwarders.remove(key, forwarder);
    }

    /// The preferred forwarder for `key`.
    pub fn forwarder_for(&self, key: &NodePublic) -> Option<Arc<dyn PacketForwarder>> {
        self.forwarders.get(key)
    }

    /// The forwarder table.
    pub fn forwarders(&self) -> &ForwarderTable {
        &self.forwarders
    }

    /// Run client admission for `key` connecting from `source`.
    pub async fn verify_client(&self, key: NodePublic, source: IpAddr) -> Result<(), AdmissionError> {
        self.admission.verify(key, source).await
    }
}

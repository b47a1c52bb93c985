//! Mesh federation with peer relays.
//!
//! For each configured peer the federator opens one outbound mesh client
//! (authenticated by the shared mesh key) and runs a watch loop that mirrors
//! the peer's presence events into this relay's forwarder table:
//!
//! - `PeerPresent(key)` registers the mesh connection as a forwarder for `key`.
//! - `PeerGone(key, Disconnected)` removes exactly that registration.
//!
//! Events from one connection are applied in the order received. When the
//! connection drops, every registration the loop installed is removed before
//! it reconnects.

use crate::config::MeshPeerConfig;
use crate::dialer::{Dialer, DirectDialer, DnsLookup};
use crate::engine::{PacketForwarder, RelayServer};
use crate::tls::{self, ClientTls, TlsError};
use async_trait::async_trait;
use bytes::Bytes;
use derp_types::{MeshKey, MeshMessage, NodePrivate, NodePublic, PeerGoneReason};
use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Reconnect delay used when a client does not choose its own.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Mesh setup errors, reported per peer.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// No mesh key is installed on the relay.
    #[error("mesh({peer}): no mesh key installed")]
    MissingMeshKey {
        /// The peer hostname.
        peer: String,
    },
    /// Building the outbound TLS configuration failed.
    #[error("mesh({peer}): TLS setup failed: {source}")]
    Tls {
        /// The peer hostname.
        peer: String,
        /// Underlying TLS error.
        source: TlsError,
    },
    /// The mesh client could not be created.
    #[error("mesh({peer}): {source}")]
    Client {
        /// The peer hostname.
        peer: String,
        /// Underlying client error.
        source: MeshClientError,
    },
}

/// Errors from a mesh client.
#[derive(Debug, thiserror::Error)]
pub enum MeshClientError {
    /// The client was closed and will not reconnect.
    #[error("mesh client closed")]
    Closed,
    /// The connection failed or dropped; a reconnect may succeed.
    #[error("mesh connection failed: {0}")]
    Connection(String),
}

/// Everything a mesh client needs to reach one peer.
#[derive(Clone)]
pub struct MeshClientParams {
    /// Peer relay endpoint, `https://<server>:<port>/derp`.
    pub url: String,
    /// Peer hostname, for logging and TLS.
    pub hostname: String,
    /// This node's private key.
    pub private_key: NodePrivate,
    /// The shared mesh key.
    pub mesh_key: MeshKey,
    /// Outbound TLS configuration if enabled for the peer; the client's default otherwise.
    pub tls: Option<ClientTls>,
    /// Dialer for this peer.
    pub dialer: Arc<dyn Dialer>,
    /// Ask the peer to stream presence changes.
    pub watch_connection_changes: bool,
}

impl std::fmt::Debug for MeshClientParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshClientParams")
            .field("url", &self.url)
            .field("hostname", &self.hostname)
            .field("tls", &self.tls)
            .field("watch_connection_changes", &self.watch_connection_changes)
            .finish_non_exhaustive()
    }
}

/// A connection to one peer relay.
#[async_trait]
pub trait MeshClient: Send + Sync {
    /// Connect, or reconnect after a failure, and return the peer's public key.
    async fn connect(&self) -> Result<NodePublic, MeshClientError>;

    /// Wait for the next presence event.
    async fn recv(&self) -> Result<MeshMessage, MeshClientError>;

    /// Send a packet from `src` to `dst` through the peer.
    async fn forward_packet(&self, src: NodePublic, dst: NodePublic, packet: Bytes)
        -> io::Result<()>;

    /// Pause before reconnecting after a failure.
    fn retry_delay(&self) -> Duration {
        DEFAULT_RETRY_DELAY
    }

    /// Release the connection.
    async fn close(&self) {}
}

/// Creates mesh clients.
pub trait MeshConnector: Send + Sync {
    /// Create a client for one peer. It must not connect until [`MeshClient::connect`].
    fn new_client(&self, params: MeshClientParams) -> Result<Arc<dyn MeshClient>, MeshClientError>;
}

/// The registration identity of one watch loop's connection.
struct MeshForwarder(Arc<dyn MeshClient>);

#[async_trait]
impl PacketForwarder for MeshForwarder {
    async fn forward_packet(
        &self,
        src: NodePublic,
        dst: NodePublic,
        packet: Bytes,
    ) -> io::Result<()> {
        self.0.forward_packet(src, dst, packet).await
    }
}

/// Starts and tracks one watch loop per peer.
pub struct MeshFederator {
    server: Arc<RelayServer>,
    connector: Arc<dyn MeshConnector>,
    resolver: Arc<dyn DnsLookup>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for MeshFederator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshFederator")
            .field("loops", &self.tracker.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl MeshFederator {
    /// Create a federator; loops spawn on `tracker` and stop when `cancel` fires.
    pub fn new(
        server: Arc<RelayServer>,
        connector: Arc<dyn MeshConnector>,
        resolver: Arc<dyn DnsLookup>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            server,
            connector,
            resolver,
            cancel,
            tracker,
        }
    }

    /// Set up a mesh client for `peer` and spawn its watch loop.
    pub fn start_peer(&self, peer: &MeshPeerConfig) -> Result<(), MeshError> {
        let hostname = peer.hostname().to_string();
        let mesh_key = self.server.mesh_key().ok_or_else(|| MeshError::MissingMeshKey {
            peer: hostname.clone(),
        })?;

        let dialer = Arc::new(DirectDialer::new(&peer.dialer, self.resolver.clone()));
        let tls = peer
            .enabled_tls()
            .map(|options| tls::client_config(&hostname, options))
            .transpose()
            .map_err(|e| MeshError::Tls {
                peer: hostname.clone(),
                source: e,
            })?;

        let url = peer.relay_url();
        let client = self
            .connector
            .new_client(MeshClientParams {
                url: url.clone(),
                hostname: hostname.clone(),
                private_key: self.server.private_key().clone(),
                mesh_key,
                tls,
                dialer,
                watch_connection_changes: true,
            })
            .map_err(|e| MeshError::Client {
                peer: hostname.clone(),
                source: e,
            })?;

        tracing::info!("mesh({}): watching {}", hostname, url);
        self.tracker.spawn(run_watch_loop(
            self.server.clone(),
            client,
            hostname,
            self.cancel.clone(),
        ));
        Ok(())
    }
}

async fn or_cancel<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

fn clear(
    server: &RelayServer,
    forwarder: &Arc<dyn PacketForwarder>,
    present: &mut HashSet<NodePublic>,
) {
    for key in present.drain() {
        server.remove_packet_forwarder(&key, forwarder);
    }
}

/// Mirror `client`'s presence events into `server` until canceled, closed, or self-connected.
pub async fn run_watch_loop(
    server: Arc<RelayServer>,
    client: Arc<dyn MeshClient>,
    peer: String,
    cancel: CancellationToken,
) {
    let forwarder: Arc<dyn PacketForwarder> = Arc::new(MeshForwarder(client.clone()));
    let own_key = server.public_key();
    let mut present = HashSet::new();

    'connect: loop {
        let Some(connected) = or_cancel(&cancel, client.connect()).await else {
            break;
        };
        let server_key = match connected {
            Ok(key) => key,
            Err(MeshClientError::Closed) => break,
            Err(e) => {
                tracing::debug!("mesh({}): {}", peer, e);
                if or_cancel(&cancel, tokio::time::sleep(client.retry_delay()))
                    .await
                    .is_none()
                {
                    break;
                }
                continue;
            }
        };
        if server_key == own_key {
            tracing::info!("mesh({}): detected self-connect; ignoring host", peer);
            break;
        }
        tracing::debug!("mesh({}): connected to {}", peer, server_key);

        loop {
            let Some(received) = or_cancel(&cancel, client.recv()).await else {
                break 'connect;
            };
            match received {
                Ok(MeshMessage::PeerPresent { key, .. }) => {
                    server.add_packet_forwarder(key, forwarder.clone());
                    present.insert(key);
                }
                Ok(MeshMessage::PeerGone {
                    key,
                    reason: PeerGoneReason::Disconnected,
                }) => {
                    server.remove_packet_forwarder(&key, &forwarder);
                    present.remove(&key);
                }
                Ok(MeshMessage::PeerGone { key, reason }) => {
                    tracing::debug!(
                        "mesh({}): peer {} not at server {} ({:?})",
                        peer,
                        key,
                        server_key,
                        reason
                    );
                }
                Err(MeshClientError::Closed) => break 'connect,
                Err(e) => {
                    clear(&server, &forwarder, &mut present);
                    tracing::debug!("mesh({}): receive failed: {}", peer, e);
                    if or_cancel(&cancel, tokio::time::sleep(client.retry_delay()))
                        .await
                        .is_none()
                    {
                        break 'connect;
                    }
                    continue 'connect;
                }
            }
        }
    }

    clear(&server, &forwarder, &mut present);
    client.close().await;
    tracing::debug!("mesh({}): watch loop stopped", peer);
}

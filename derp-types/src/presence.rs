//! Presence events carried over a mesh connection.

use crate::key::NodePublic;
use std::net::SocketAddr;

/// Why a peer left a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerGoneReason {
    /// The peer disconnected from the remote relay.
    Disconnected,
    /// The remote relay never had the peer.
    NotHere,
    /// A reason this relay does not know about.
    Unknown(u8),
}

impl From<u8> for PeerGoneReason {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Disconnected,
            0x01 => Self::NotHere,
            other => Self::Unknown(other),
        }
    }
}

/// A presence event from a watched mesh peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshMessage {
    /// A client connected to the remote relay.
    PeerPresent {
        /// The client's node key.
        key: NodePublic,
        /// The client's address as seen by the remote relay, when shared.
        endpoint: Option<SocketAddr>,
    },
    /// A client left the remote relay.
    PeerGone {
        /// The client's node key.
        key: NodePublic,
        /// Why it left.
        reason: PeerGoneReason,
    },
}

impl MeshMessage {
    /// The node key the event is about.
    pub fn key(&self) -> &NodePublic {
        match self {
            Self::PeerPresent { key, .. } | Self::PeerGone { key, .. } => key,
        }
    }
}

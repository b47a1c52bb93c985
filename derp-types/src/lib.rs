//! # derp-types
//!
//! Key, presence and STUN wire types shared by the meshderp relay.
//!
//! This crate provides:
//! - [`NodePrivate`], [`NodePublic`] - Curve25519 node identity keys
//! - [`MeshKey`] - the pre-shared secret that authorizes relay-to-relay meshing
//! - [`MeshMessage`] - presence events received over a mesh connection
//! - [`stun`] - the minimal STUN binding codec used by the responder

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod key;
mod mesh_key;
mod presence;
pub mod stun;

pub use error::{KeyError, MeshKeyError, StunError};
pub use key::{NodePrivate, NodePublic, KEY_LEN};
pub use mesh_key::MeshKey;
pub use presence::{MeshMessage, PeerGoneReason};

/// DERP protocol version advertised in the `Derp-Version` upgrade header.
pub const PROTOCOL_VERSION: u32 = 2;

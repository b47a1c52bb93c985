//! # meshderp-relay
//!
//! DERP relay inbound for a proxy platform.
//!
//! This crate terminates TLS for DERP clients and hands each client connection
//! to a host-supplied protocol engine:
//! - Accepts HTTP/1.1 and HTTP/2 over TLS on one listener
//! - Bridges both the binary `Upgrade: DERP` and the WebSocket `derp`
//!   subprotocol transports into one [`RelaySession`] shape
//! - Answers STUN binding requests on a UDP port
//! - Federates with peer relays through a shared mesh key
//!
//! ## Architecture
//!
//! ```text
//! DERP client ──TLS──┐                           ┌── peer relay
//!                    │                           │    (mesh client)
//!        ┌───────────┴───────────────────────────┴──┐
//!        │              RelayInbound                │
//!        │  http router ─► bridge ─► SessionHandler │
//!        │  stun responder        MeshFederator     │
//!        │            └── RelayServer ──┘           │
//!        └──────────────────────────────────────────┘
//! STUN client ──UDP──┘
//! ```
//!
//! ## Lifecycle
//!
//! [`RelayInbound::start`] binds everything, [`RelayInbound::post_start`]
//! starts mesh federation and [`RelayInbound::close`] releases it all.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod config;
pub mod dialer;
pub mod engine;
pub mod error;
pub mod http;
pub mod inbound;
pub mod keystore;
pub mod mesh;
pub mod metrics;
pub mod stun;
pub mod tls;

pub use config::{ConfigError, InboundConfig};
pub use engine::{PacketForwarder, RelayServer, RelaySession, SessionHandler, Transport};
pub use error::{InboundError, Result};
pub use inbound::{Collaborators, InboundState, RelayInbound};
pub use mesh::{MeshClient, MeshConnector};

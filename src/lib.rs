//! # Burrow - Peer-to-Peer QUIC Transport
//!
//! Burrow establishes peer-authenticated QUIC sessions between peers, with
//! two properties that make it NAT-friendly:
//!
//! - **Socket reuse**: listeners and outbound dials on the same host share a
//!   local port through a reference-counted socket pool, so a remote peer
//!   always sees a predictable return address
//! - **Hole punching**: when both sides dial each other simultaneously, the
//!   server-role side sprays random UDP toward the remote endpoint while the
//!   accept path races to deliver the matching inbound session
//!
//! ## Identity Model
//!
//! - **Identity = Public Key**: the 32-byte Ed25519 public key IS the peer id
//! - **Self-Signed Certs**: each transport derives its certificate from its
//!   keypair; mutual TLS authenticates both ends of every session
//! - **Gating**: an optional policy hook rejects secured connections with a
//!   dedicated wire code
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `transport` | [`QuicTransport`] facade: dial, hole punch, listen, gating |
//! | `listener` | Accept loop and inbound hole-punch matching |
//! | `reuse` | Reference-counted socket pool with idle reaper |
//! | `manager` | Per-family dispatch, reuse on/off |
//! | `socket` | Counted and single-use UDP sockets, quinn adapter |
//! | `punch` | Hole-punch rendezvous table |
//! | `identity` | Keypairs and peer ids |
//! | `crypto` | TLS certificates, verifiers, QUIC parameters |

mod crypto;
mod identity;
mod listener;
mod manager;
mod punch;
mod reuse;
mod socket;
mod transport;

pub use crypto::{
    QuicParams, ALPN, QUIC_VERSION_1, QUIC_VERSION_DRAFT_29, STATELESS_RESET_KEY_INFO,
};
pub use identity::{Keypair, PeerId};
pub use listener::Listener;
pub use manager::Network;
pub use reuse::ReuseConfig;
pub use socket::{CountedSocket, TransportSocket};
pub use transport::{
    Connection, ConnectionGater, DialOpts, Direction, QuicEngine, QuicTransport, QuinnEngine,
    TransportConfig, TransportError, GATING_ERROR_CODE, HOLE_PUNCH_TIMEOUT,
};

//! Peermesh: the peer-to-peer networking core of a blockchain node
//!
//! This crate establishes, authenticates, frames, and maintains connections
//! in a gossip mesh:
//! - Binary wire protocol with per-type codecs and truncated-digest
//!   checksums
//! - Ordered handshake (VERSION, SELF_CHECK, PROOF) with an anti-Sybil
//!   proof-of-work gate and replay-salt tracking
//! - Request/response correlation with single-slot reply inboxes
//! - Capacity-bounded connection lifecycle with dial backoff and keepalive
//! - Peer-address dissemination and pluggable persistence
//!
//! Block and transaction semantics stay outside: implement
//! [`chain::DomainAdapter`] to receive forwarded domain messages and supply
//! the chain tip, and [`store::PeerStore`] to persist known addresses.
//!
//! # Example
//!
//! ```rust,no_run
//! use peermesh::{PeerManager, Settings, StaticDomain, MemoryPeerStore};
//! use std::sync::Arc;
//!
//! # async fn run() -> std::io::Result<()> {
//! let manager = PeerManager::new(
//!     Settings::default(),
//!     Arc::new(StaticDomain::genesis()),
//!     Arc::new(MemoryPeerStore::new()),
//! );
//! let local = manager.start().await?;
//! println!("listening on {}", local);
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod network;
pub mod settings;
pub mod store;

// Re-export commonly used types
pub use chain::{ChainTip, DomainAdapter, StaticDomain};
pub use network::{
    Direction, HandshakeState, Message, MessageType, Payload, Peer, PeerAddress, PeerError,
    PeerId, PeerManager, ProtocolError, PROTOCOL_VERSION,
};
pub use settings::Settings;
pub use store::{FilePeerStore, MemoryPeerStore, PeerRecord, PeerStore, StoreError};

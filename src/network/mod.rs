//! P2P networking core
//!
//! Establishes, authenticates, frames, and maintains connections to other
//! nodes in the gossip mesh.
//!
//! # Features
//! - Custom binary wire protocol with magic, checksums, and a closed type
//!   registry
//! - Multi-stage handshake with self-connection detection and an
//!   anti-Sybil proof-of-work gate
//! - Request/response correlation over a single socket
//! - Bounded-capacity connection management with dial backoff
//! - Peer discovery dissemination (legacy and V2 peer lists)

pub mod address;
pub mod codec;
pub mod handshake;
pub mod manager;
pub mod message;
pub mod peer;
pub mod pow;

pub use address::{AddressError, PeerAddress, DEFAULT_PORT};
pub use codec::{checksum, MessageCodec, ProtocolError, CHECKSUM_LENGTH, MAGIC};
pub use handshake::{HandshakeError, HandshakeState};
pub use manager::PeerManager;
pub use message::{
    protocol_version_of, BlockSignature, BlockSummary, GeneratorKey, Message, MessageType,
    Payload, PeerId, TransactionSignature, VerificationCode, BLOCK_SIGNATURE_LENGTH,
    GENERATOR_KEY_LENGTH, MAX_DATA_SIZE, PEER_ID_LENGTH, PROTOCOL_VERSION,
    TRANSACTION_SIGNATURE_LENGTH, USER_AGENT,
};
pub use peer::{Direction, Peer, PeerError, RemoteVersion};
pub use pow::{ProofError, ProofOfWork, DEFAULT_DIFFICULTY, DEFAULT_MAX_SKEW_MS};

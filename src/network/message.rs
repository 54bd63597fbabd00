//! Wire message catalog
//!
//! Defines the closed set of message types exchanged in the gossip mesh and
//! the hand-rolled big-endian payload codec for each. Dispatch both ways is
//! an explicit match table: adding a type means adding a variant, a type
//! code, and its two match arms.

use super::address::PeerAddress;
use super::codec::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use std::fmt;
use std::net::Ipv4Addr;

/// Announced protocol generation. Peers derive each other's generation from
/// the leading semver component of the VERSION user-agent string.
pub const PROTOCOL_VERSION: u32 = 2;

/// User agent sent in VERSION messages.
pub const USER_AGENT: &str = concat!("peermesh/", env!("CARGO_PKG_VERSION"));

/// Hard cap on a single message payload, enforced on encode and decode.
pub const MAX_DATA_SIZE: usize = 1024 * 1024;

/// Fixed field widths shared with the block domain. Signatures and keys are
/// written raw at these lengths, without a length prefix.
pub const BLOCK_SIGNATURE_LENGTH: usize = 128;
pub const TRANSACTION_SIGNATURE_LENGTH: usize = 64;
pub const GENERATOR_KEY_LENGTH: usize = 32;
pub const PEER_ID_LENGTH: usize = 128;

pub type BlockSignature = [u8; BLOCK_SIGNATURE_LENGTH];
pub type TransactionSignature = [u8; TRANSACTION_SIGNATURE_LENGTH];
pub type GeneratorKey = [u8; GENERATOR_KEY_LENGTH];
pub type VerificationCode = [u8; PEER_ID_LENGTH];

/// Random token identifying one node process, exchanged during the
/// SELF_CHECK handshake stage to detect loopback connections.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerId(pub [u8; PEER_ID_LENGTH]);

impl PeerId {
    /// Generate a fresh random token. One is drawn per process run.
    pub fn random() -> Self {
        let mut id = [0u8; PEER_ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}..)", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..8]))
    }
}

/// One entry of a BLOCK_SUMMARIES payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub height: u32,
    pub signature: BlockSignature,
    pub generator: GeneratorKey,
}

/// Registry of wire type codes. The set is closed; codes are stable and
/// assigned in catalog order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    GetPeers = 1,
    Peers = 2,
    Height = 3,
    GetSignatures = 4,
    Signatures = 5,
    GetBlock = 6,
    Block = 7,
    Transaction = 8,
    Ping = 9,
    Version = 10,
    PeerId = 11,
    Proof = 12,
    PeersV2 = 13,
    GetBlockSummaries = 14,
    BlockSummaries = 15,
    GetSignaturesV2 = 16,
    PeerVerify = 17,
    VerificationCodes = 18,
    HeightV2 = 19,
    GetTransaction = 20,
    GetUnconfirmedTransactions = 21,
    TransactionSignatures = 22,
    GetArbitraryData = 23,
    ArbitraryData = 24,
}

impl MessageType {
    /// Wire code for this type.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Look up a received type code. `None` means foreign traffic.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::GetPeers,
            2 => Self::Peers,
            3 => Self::Height,
            4 => Self::GetSignatures,
            5 => Self::Signatures,
            6 => Self::GetBlock,
            7 => Self::Block,
            8 => Self::Transaction,
            9 => Self::Ping,
            10 => Self::Version,
            11 => Self::PeerId,
            12 => Self::Proof,
            13 => Self::PeersV2,
            14 => Self::GetBlockSummaries,
            15 => Self::BlockSummaries,
            16 => Self::GetSignaturesV2,
            17 => Self::PeerVerify,
            18 => Self::VerificationCodes,
            19 => Self::HeightV2,
            20 => Self::GetTransaction,
            21 => Self::GetUnconfirmedTransactions,
            22 => Self::TransactionSignatures,
            23 => Self::GetArbitraryData,
            24 => Self::ArbitraryData,
            _ => return None,
        })
    }

    /// Protocol name for logging.
    pub fn name(self) -> &'static str {
        match self {
            Self::GetPeers => "GET_PEERS",
            Self::Peers => "PEERS",
            Self::Height => "HEIGHT",
            Self::GetSignatures => "GET_SIGNATURES",
            Self::Signatures => "SIGNATURES",
            Self::GetBlock => "GET_BLOCK",
            Self::Block => "BLOCK",
            Self::Transaction => "TRANSACTION",
            Self::Ping => "PING",
            Self::Version => "VERSION",
            Self::PeerId => "PEER_ID",
            Self::Proof => "PROOF",
            Self::PeersV2 => "PEERS_V2",
            Self::GetBlockSummaries => "GET_BLOCK_SUMMARIES",
            Self::BlockSummaries => "BLOCK_SUMMARIES",
            Self::GetSignaturesV2 => "GET_SIGNATURES_V2",
            Self::PeerVerify => "PEER_VERIFY",
            Self::VerificationCodes => "VERIFICATION_CODES",
            Self::HeightV2 => "HEIGHT_V2",
            Self::GetTransaction => "GET_TRANSACTION",
            Self::GetUnconfirmedTransactions => "GET_UNCONFIRMED_TRANSACTIONS",
            Self::TransactionSignatures => "TRANSACTION_SIGNATURES",
            Self::GetArbitraryData => "GET_ARBITRARY_DATA",
            Self::ArbitraryData => "ARBITRARY_DATA",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded payload of a message, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    GetPeers,
    /// Legacy peer list: bare IPv4 addresses, no port.
    Peers(Vec<Ipv4Addr>),
    Height(u32),
    GetSignatures {
        parent: BlockSignature,
    },
    Signatures(Vec<BlockSignature>),
    GetBlock {
        signature: BlockSignature,
    },
    /// Serialized block bytes are opaque to this layer; the block domain
    /// collaborator produces and consumes them.
    Block {
        height: u32,
        data: Vec<u8>,
    },
    /// Opaque serialized transaction from the domain collaborator.
    Transaction(Vec<u8>),
    Ping,
    Version {
        build_time: i64,
        user_agent: String,
    },
    PeerId(PeerId),
    Proof {
        timestamp: i64,
        salt: u64,
        nonce: u64,
    },
    /// `host:port` peer list. The first entry carries the sender's own
    /// listening port, with a wildcard host the receiver fills in from the
    /// socket.
    PeersV2(Vec<PeerAddress>),
    GetBlockSummaries {
        parent: BlockSignature,
        count: u32,
    },
    BlockSummaries(Vec<BlockSummary>),
    GetSignaturesV2 {
        parent: BlockSignature,
        count: u32,
    },
    PeerVerify(VerificationCode),
    VerificationCodes {
        ours: VerificationCode,
        theirs: VerificationCode,
    },
    HeightV2 {
        height: u32,
        signature: BlockSignature,
        timestamp: i64,
        generator: GeneratorKey,
    },
    GetTransaction {
        signature: TransactionSignature,
    },
    GetUnconfirmedTransactions,
    TransactionSignatures(Vec<TransactionSignature>),
    GetArbitraryData {
        signature: TransactionSignature,
    },
    ArbitraryData {
        signature: TransactionSignature,
        data: Vec<u8>,
    },
}

impl Payload {
    /// The wire type of this payload.
    pub fn kind(&self) -> MessageType {
        match self {
            Payload::GetPeers => MessageType::GetPeers,
            Payload::Peers(_) => MessageType::Peers,
            Payload::Height(_) => MessageType::Height,
            Payload::GetSignatures { .. } => MessageType::GetSignatures,
            Payload::Signatures(_) => MessageType::Signatures,
            Payload::GetBlock { .. } => MessageType::GetBlock,
            Payload::Block { .. } => MessageType::Block,
            Payload::Transaction(_) => MessageType::Transaction,
            Payload::Ping => MessageType::Ping,
            Payload::Version { .. } => MessageType::Version,
            Payload::PeerId(_) => MessageType::PeerId,
            Payload::Proof { .. } => MessageType::Proof,
            Payload::PeersV2(_) => MessageType::PeersV2,
            Payload::GetBlockSummaries { .. } => MessageType::GetBlockSummaries,
            Payload::BlockSummaries(_) => MessageType::BlockSummaries,
            Payload::GetSignaturesV2 { .. } => MessageType::GetSignaturesV2,
            Payload::PeerVerify(_) => MessageType::PeerVerify,
            Payload::VerificationCodes { .. } => MessageType::VerificationCodes,
            Payload::HeightV2 { .. } => MessageType::HeightV2,
            Payload::GetTransaction { .. } => MessageType::GetTransaction,
            Payload::GetUnconfirmedTransactions => MessageType::GetUnconfirmedTransactions,
            Payload::TransactionSignatures(_) => MessageType::TransactionSignatures,
            Payload::GetArbitraryData { .. } => MessageType::GetArbitraryData,
            Payload::ArbitraryData { .. } => MessageType::ArbitraryData,
        }
    }

    /// Serialize the payload body (everything after the frame header).
    pub fn write(&self, out: &mut BytesMut) {
        match self {
            Payload::GetPeers | Payload::Ping | Payload::GetUnconfirmedTransactions => {}
            Payload::Peers(addrs) => {
                out.put_u32(addrs.len() as u32);
                for ip in addrs {
                    out.put_slice(&ip.octets());
                }
            }
            Payload::Height(height) => out.put_u32(*height),
            Payload::GetSignatures { parent } => out.put_slice(parent),
            Payload::Signatures(signatures) => {
                out.put_u32(signatures.len() as u32);
                for signature in signatures {
                    out.put_slice(signature);
                }
            }
            Payload::GetBlock { signature } => out.put_slice(signature),
            Payload::Block { height, data } => {
                out.put_u32(*height);
                out.put_slice(data);
            }
            Payload::Transaction(data) => out.put_slice(data),
            Payload::Version {
                build_time,
                user_agent,
            } => {
                out.put_i64(*build_time);
                put_string(out, user_agent);
            }
            Payload::PeerId(id) => out.put_slice(id.as_bytes()),
            Payload::Proof {
                timestamp,
                salt,
                nonce,
            } => {
                out.put_i64(*timestamp);
                out.put_u64(*salt);
                out.put_u64(*nonce);
            }
            Payload::PeersV2(addrs) => {
                out.put_u32(addrs.len() as u32);
                for addr in addrs {
                    put_string(out, &addr.to_string());
                }
            }
            Payload::GetBlockSummaries { parent, count } => {
                out.put_slice(parent);
                out.put_u32(*count);
            }
            Payload::BlockSummaries(summaries) => {
                out.put_u32(summaries.len() as u32);
                for summary in summaries {
                    out.put_u32(summary.height);
                    out.put_slice(&summary.signature);
                    out.put_slice(&summary.generator);
                }
            }
            Payload::GetSignaturesV2 { parent, count } => {
                out.put_slice(parent);
                out.put_u32(*count);
            }
            Payload::PeerVerify(code) => out.put_slice(code),
            Payload::VerificationCodes { ours, theirs } => {
                out.put_slice(ours);
                out.put_slice(theirs);
            }
            Payload::HeightV2 {
                height,
                signature,
                timestamp,
                generator,
            } => {
                out.put_u32(*height);
                out.put_slice(signature);
                out.put_i64(*timestamp);
                out.put_slice(generator);
            }
            Payload::GetTransaction { signature } => out.put_slice(signature),
            Payload::TransactionSignatures(signatures) => {
                out.put_u32(signatures.len() as u32);
                for signature in signatures {
                    out.put_slice(signature);
                }
            }
            Payload::GetArbitraryData { signature } => out.put_slice(signature),
            Payload::ArbitraryData { signature, data } => {
                out.put_slice(signature);
                out.put_u32(data.len() as u32);
                out.put_slice(data);
            }
        }
    }

    /// Decode a payload body of the given type. The whole slice must be
    /// consumed, except by the opaque-tail types (BLOCK, TRANSACTION).
    pub fn read(kind: MessageType, data: &[u8]) -> Result<Payload, ProtocolError> {
        let mut r = FieldReader::new(kind, data);
        let payload = match kind {
            MessageType::GetPeers => Payload::GetPeers,
            MessageType::Ping => Payload::Ping,
            MessageType::GetUnconfirmedTransactions => Payload::GetUnconfirmedTransactions,
            MessageType::Peers => {
                let count = r.get_count(4)?;
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    addrs.push(Ipv4Addr::from(r.get_array::<4>()?));
                }
                Payload::Peers(addrs)
            }
            MessageType::Height => Payload::Height(r.get_u32()?),
            MessageType::GetSignatures => Payload::GetSignatures {
                parent: r.get_array()?,
            },
            MessageType::Signatures => {
                let count = r.get_count(BLOCK_SIGNATURE_LENGTH)?;
                let mut signatures = Vec::with_capacity(count);
                for _ in 0..count {
                    signatures.push(r.get_array()?);
                }
                Payload::Signatures(signatures)
            }
            MessageType::GetBlock => Payload::GetBlock {
                signature: r.get_array()?,
            },
            MessageType::Block => Payload::Block {
                height: r.get_u32()?,
                data: r.take_rest(),
            },
            MessageType::Transaction => Payload::Transaction(r.take_rest()),
            MessageType::Version => Payload::Version {
                build_time: r.get_i64()?,
                user_agent: r.get_string()?,
            },
            MessageType::PeerId => Payload::PeerId(PeerId(r.get_array()?)),
            MessageType::Proof => Payload::Proof {
                timestamp: r.get_i64()?,
                salt: r.get_u64()?,
                nonce: r.get_u64()?,
            },
            MessageType::PeersV2 => {
                let count = r.get_count(4)?;
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    let s = r.get_string()?;
                    let addr = PeerAddress::parse(&s)
                        .map_err(|_| ProtocolError::Malformed(kind.name()))?;
                    addrs.push(addr);
                }
                Payload::PeersV2(addrs)
            }
            MessageType::GetBlockSummaries => Payload::GetBlockSummaries {
                parent: r.get_array()?,
                count: r.get_u32()?,
            },
            MessageType::BlockSummaries => {
                let entry = 4 + BLOCK_SIGNATURE_LENGTH + GENERATOR_KEY_LENGTH;
                let count = r.get_count(entry)?;
                let mut summaries = Vec::with_capacity(count);
                for _ in 0..count {
                    summaries.push(BlockSummary {
                        height: r.get_u32()?,
                        signature: r.get_array()?,
                        generator: r.get_array()?,
                    });
                }
                Payload::BlockSummaries(summaries)
            }
            MessageType::GetSignaturesV2 => Payload::GetSignaturesV2 {
                parent: r.get_array()?,
                count: r.get_u32()?,
            },
            MessageType::PeerVerify => Payload::PeerVerify(r.get_array()?),
            MessageType::VerificationCodes => Payload::VerificationCodes {
                ours: r.get_array()?,
                theirs: r.get_array()?,
            },
            MessageType::HeightV2 => Payload::HeightV2 {
                height: r.get_u32()?,
                signature: r.get_array()?,
                timestamp: r.get_i64()?,
                generator: r.get_array()?,
            },
            MessageType::GetTransaction => Payload::GetTransaction {
                signature: r.get_array()?,
            },
            MessageType::TransactionSignatures => {
                let count = r.get_count(TRANSACTION_SIGNATURE_LENGTH)?;
                let mut signatures = Vec::with_capacity(count);
                for _ in 0..count {
                    signatures.push(r.get_array()?);
                }
                Payload::TransactionSignatures(signatures)
            }
            MessageType::GetArbitraryData => Payload::GetArbitraryData {
                signature: r.get_array()?,
            },
            MessageType::ArbitraryData => {
                let signature = r.get_array()?;
                let len = r.get_count(1)?;
                Payload::ArbitraryData {
                    signature,
                    data: r.get_blob(len)?,
                }
            }
        };
        r.finish()?;
        Ok(payload)
    }
}

/// A framed message: payload plus an optional correlation id. An absent id
/// is distinct from id 0; generated ids are strictly positive.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Option<u32>,
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self { id: None, payload }
    }

    pub fn with_id(id: u32, payload: Payload) -> Self {
        Self {
            id: Some(id),
            payload,
        }
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }
}

/// Derive the protocol generation from a VERSION user-agent string, e.g.
/// `peermesh/2.0.0` reports generation 2. Unparsable agents count as the
/// oldest generation.
pub fn protocol_version_of(user_agent: &str) -> u32 {
    let semver = user_agent.rsplit('/').next().unwrap_or(user_agent);
    let major = semver.split('.').next().unwrap_or("");
    major.trim().parse().unwrap_or(1)
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_u32(s.len() as u32);
    out.put_slice(s.as_bytes());
}

/// Bounds-checked cursor over a payload body.
struct FieldReader<'a> {
    buf: &'a [u8],
    kind: MessageType,
}

impl<'a> FieldReader<'a> {
    fn new(kind: MessageType, buf: &'a [u8]) -> Self {
        Self { buf, kind }
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            Err(ProtocolError::Malformed(self.kind.name()))
        } else {
            Ok(())
        }
    }

    fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn get_u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn get_i64(&mut self) -> Result<i64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    /// Element count whose entries take at least `elem_size` bytes each;
    /// rejects counts the remaining bytes cannot possibly satisfy.
    fn get_count(&mut self, elem_size: usize) -> Result<usize, ProtocolError> {
        let count = self.get_u32()? as usize;
        if count.saturating_mul(elem_size) > self.buf.remaining() {
            return Err(ProtocolError::Malformed(self.kind.name()));
        }
        Ok(count)
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn get_blob(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.need(len)?;
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Length-prefixed UTF-8 string.
    fn get_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.get_count(1)?;
        let bytes = self.get_blob(len)?;
        String::from_utf8(bytes).map_err(|_| ProtocolError::Malformed(self.kind.name()))
    }

    fn take_rest(&mut self) -> Vec<u8> {
        let rest = self.buf.to_vec();
        self.buf = &[];
        rest
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        if self.buf.has_remaining() {
            Err(ProtocolError::Malformed(self.kind.name()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(payload: Payload) {
        let mut buf = BytesMut::new();
        payload.write(&mut buf);
        let decoded = Payload::read(payload.kind(), &buf).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_empty_payloads_round_trip() {
        round_trip(Payload::GetPeers);
        round_trip(Payload::Ping);
        round_trip(Payload::GetUnconfirmedTransactions);
    }

    #[test]
    fn test_height_round_trip() {
        round_trip(Payload::Height(12345));
    }

    #[test]
    fn test_version_round_trip() {
        round_trip(Payload::Version {
            build_time: 1_700_000_000_123,
            user_agent: USER_AGENT.to_string(),
        });
        round_trip(Payload::Version {
            build_time: 0,
            user_agent: String::new(),
        });
    }

    #[test]
    fn test_signature_payloads_round_trip() {
        let sig = [7u8; BLOCK_SIGNATURE_LENGTH];
        round_trip(Payload::GetSignatures { parent: sig });
        round_trip(Payload::GetBlock { signature: sig });
        round_trip(Payload::Signatures(vec![sig, [9u8; BLOCK_SIGNATURE_LENGTH]]));
        round_trip(Payload::Signatures(vec![]));
        round_trip(Payload::GetSignaturesV2 {
            parent: sig,
            count: 500,
        });
        round_trip(Payload::TransactionSignatures(vec![
            [1u8; TRANSACTION_SIGNATURE_LENGTH],
            [2u8; TRANSACTION_SIGNATURE_LENGTH],
        ]));
        round_trip(Payload::GetTransaction {
            signature: [3u8; TRANSACTION_SIGNATURE_LENGTH],
        });
    }

    #[test]
    fn test_block_and_transaction_round_trip() {
        round_trip(Payload::Block {
            height: 42,
            data: vec![0xAB; 1024],
        });
        round_trip(Payload::Block {
            height: 0,
            data: vec![],
        });
        // Maximum-size payload: the height word plus data fills MAX_DATA_SIZE.
        round_trip(Payload::Block {
            height: 1,
            data: vec![0x55; MAX_DATA_SIZE - 4],
        });
        round_trip(Payload::Transaction(vec![1, 2, 3]));
        round_trip(Payload::Transaction(vec![]));
    }

    #[test]
    fn test_peer_payloads_round_trip() {
        round_trip(Payload::Peers(vec![
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(192, 168, 1, 42),
        ]));
        round_trip(Payload::PeersV2(vec![
            PeerAddress::new("0.0.0.0", 9784),
            PeerAddress::new("node.example.com", 9784),
            PeerAddress::new("2001:db8::1", 9000),
        ]));
        round_trip(Payload::PeerId(PeerId::random()));
        round_trip(Payload::PeerVerify([6u8; PEER_ID_LENGTH]));
        round_trip(Payload::VerificationCodes {
            ours: [1u8; PEER_ID_LENGTH],
            theirs: [2u8; PEER_ID_LENGTH],
        });
    }

    #[test]
    fn test_proof_round_trip() {
        round_trip(Payload::Proof {
            timestamp: 1_700_000_000_000,
            salt: u64::MAX,
            nonce: 0,
        });
    }

    #[test]
    fn test_summary_payloads_round_trip() {
        round_trip(Payload::GetBlockSummaries {
            parent: [4u8; BLOCK_SIGNATURE_LENGTH],
            count: 10,
        });
        round_trip(Payload::BlockSummaries(vec![BlockSummary {
            height: 7,
            signature: [8u8; BLOCK_SIGNATURE_LENGTH],
            generator: [9u8; GENERATOR_KEY_LENGTH],
        }]));
        round_trip(Payload::HeightV2 {
            height: 1000,
            signature: [5u8; BLOCK_SIGNATURE_LENGTH],
            timestamp: 1_699_999_999_999,
            generator: [6u8; GENERATOR_KEY_LENGTH],
        });
    }

    #[test]
    fn test_arbitrary_data_round_trip() {
        round_trip(Payload::GetArbitraryData {
            signature: [1u8; TRANSACTION_SIGNATURE_LENGTH],
        });
        round_trip(Payload::ArbitraryData {
            signature: [2u8; TRANSACTION_SIGNATURE_LENGTH],
            data: vec![0xCD; 256],
        });
        round_trip(Payload::ArbitraryData {
            signature: [3u8; TRANSACTION_SIGNATURE_LENGTH],
            data: vec![],
        });
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let mut buf = BytesMut::new();
        Payload::Height(9).write(&mut buf);
        let err = Payload::read(MessageType::Height, &buf[..3]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let mut buf = BytesMut::new();
        Payload::Height(9).write(&mut buf);
        buf.put_u8(0);
        let err = Payload::read(MessageType::Height, &buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_count_cannot_exceed_remaining_bytes() {
        // Claims 1000 signatures but carries none.
        let mut buf = BytesMut::new();
        buf.put_u32(1000);
        let err = Payload::read(MessageType::Signatures, &buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_invalid_utf8_version_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_i64(0);
        buf.put_u32(2);
        buf.put_slice(&[0xFF, 0xFE]);
        let err = Payload::read(MessageType::Version, &buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_type_registry_is_closed() {
        for code in 1..=24 {
            let kind = MessageType::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(MessageType::from_code(0), None);
        assert_eq!(MessageType::from_code(25), None);
        assert_eq!(MessageType::from_code(u32::MAX), None);
    }

    #[test]
    fn test_protocol_version_of() {
        assert_eq!(protocol_version_of("peermesh/2.0.0"), 2);
        assert_eq!(protocol_version_of("peermesh/1.9.3"), 1);
        assert_eq!(protocol_version_of("3.1.0"), 3);
        assert_eq!(protocol_version_of("garbage"), 1);
        assert_eq!(protocol_version_of(""), 1);
    }

    #[test]
    fn test_message_id_is_distinct_from_zero() {
        let plain = Message::new(Payload::Ping);
        let zero = Message::with_id(0, Payload::Ping);
        assert_ne!(plain, zero);
        assert_eq!(plain.kind(), MessageType::Ping);
    }
}

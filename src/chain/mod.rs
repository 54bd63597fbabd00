//! Domain collaborator interface
//!
//! The networking layer carries serialized blocks and transactions without
//! looking inside them. Everything chain-shaped comes through this trait:
//! the current tip for height announcements, a handler for forwarded
//! messages, and the periodic broadcast hook.

use crate::network::message::{
    BlockSignature, GeneratorKey, Message, BLOCK_SIGNATURE_LENGTH, GENERATOR_KEY_LENGTH,
};
use crate::network::peer::Peer;
use std::sync::Arc;

/// Snapshot of the local chain's best block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub height: u32,
    pub signature: BlockSignature,
    pub timestamp: i64,
    pub generator: GeneratorKey,
}

impl ChainTip {
    /// All-zero tip for nodes that carry no chain of their own.
    pub fn genesis() -> Self {
        Self {
            height: 1,
            signature: [0u8; BLOCK_SIGNATURE_LENGTH],
            timestamp: 0,
            generator: [0u8; GENERATOR_KEY_LENGTH],
        }
    }
}

/// Consensus/mempool-side collaborator of the peer manager.
///
/// Implementations must not block: `on_message` runs on the delivering
/// connection's task, so anything slow belongs on a task of its own.
pub trait DomainAdapter: Send + Sync + 'static {
    /// Current tip, announced to peers after each completed handshake.
    fn chain_tip(&self) -> ChainTip;

    /// Called for every post-handshake message the networking layer does
    /// not handle itself (BLOCK, TRANSACTION, GET_*, and the rest).
    fn on_message(&self, peer: &Arc<Peer>, message: Message);

    /// Invoked on the manager's broadcast interval; returned messages are
    /// fanned out to every handshake-completed peer.
    fn broadcast_messages(&self) -> Vec<Message> {
        Vec::new()
    }
}

/// Minimal domain adapter with a fixed tip. Lets a node join the mesh,
/// answer keepalives, and relay peer lists without a consensus engine;
/// forwarded domain traffic is only logged.
pub struct StaticDomain {
    tip: ChainTip,
}

impl StaticDomain {
    pub fn new(tip: ChainTip) -> Self {
        Self { tip }
    }

    pub fn genesis() -> Self {
        Self::new(ChainTip::genesis())
    }
}

impl DomainAdapter for StaticDomain {
    fn chain_tip(&self) -> ChainTip {
        self.tip
    }

    fn on_message(&self, peer: &Arc<Peer>, message: Message) {
        log::debug!("{} from {} has no domain handler here", message.kind(), peer);
    }

    fn broadcast_messages(&self) -> Vec<Message> {
        let tip = self.chain_tip();
        vec![Message::new(crate::network::message::Payload::HeightV2 {
            height: tip.height,
            signature: tip.signature,
            timestamp: tip.timestamp,
            generator: tip.generator,
        })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{MessageType, Payload};

    #[test]
    fn test_static_domain_announces_its_tip() {
        let domain = StaticDomain::genesis();
        assert_eq!(domain.chain_tip().height, 1);

        let announced = domain.broadcast_messages();
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].kind(), MessageType::HeightV2);
        if let Payload::HeightV2 { height, .. } = &announced[0].payload {
            assert_eq!(*height, 1);
        }
    }
}

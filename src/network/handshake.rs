//! Handshake state machine
//!
//! Every connection walks STARTED → VERSION → SELF_CHECK → (PROOF) →
//! COMPLETED before general traffic is allowed. Transitions only move
//! forward; a message of the wrong type for the current state ends the
//! session. The PROOF stage is negotiated away when either side still
//! speaks the first protocol generation.

use super::manager::PeerManager;
use super::message::{
    protocol_version_of, Message, MessageType, Payload, PROTOCOL_VERSION, USER_AGENT,
};
use super::peer::{Peer, PeerError, RemoteVersion};
use super::pow::{ProofError, ProofOfWork};
use std::sync::Arc;
use thiserror::Error;

/// Handshake progress of one connection. COMPLETED is terminal; there is
/// no backward transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Started,
    Version,
    SelfCheck,
    Proof,
    Completed,
}

impl HandshakeState {
    /// The single message type this state accepts, if any.
    pub fn expects(self) -> Option<MessageType> {
        match self {
            HandshakeState::Started | HandshakeState::Completed => None,
            HandshakeState::Version => Some(MessageType::Version),
            HandshakeState::SelfCheck => Some(MessageType::PeerId),
            HandshakeState::Proof => Some(MessageType::Proof),
        }
    }
}

/// Handshake violations. Every variant disconnects the session.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("unexpected {got} during {state:?} stage")]
    UnexpectedMessage {
        state: HandshakeState,
        got: MessageType,
    },
    #[error("connected to self")]
    SelfConnection,
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error("send failed: {0}")]
    Peer(#[from] PeerError),
    #[error("shutdown during proof computation")]
    Cancelled,
}

/// Kick off the handshake once a connection's I/O plumbing is up. The
/// outbound side opens with its VERSION; the inbound side waits.
pub async fn on_ready(manager: &Arc<PeerManager>, peer: &Arc<Peer>) -> Result<(), HandshakeError> {
    peer.set_handshake_state(HandshakeState::Version).await;
    if peer.direction().is_outbound() {
        send_version(manager, peer).await?;
    }
    Ok(())
}

/// Drive the state machine with one received message. An `Err` means the
/// caller must disconnect; the state is never rolled back.
pub async fn on_message(
    manager: &Arc<PeerManager>,
    peer: &Arc<Peer>,
    message: Message,
) -> Result<(), HandshakeError> {
    let state = peer.handshake_state().await;
    let kind = message.kind();
    if state.expects() != Some(kind) {
        return Err(HandshakeError::UnexpectedMessage { state, got: kind });
    }

    match message.payload {
        Payload::Version {
            build_time,
            user_agent,
        } => {
            let protocol = protocol_version_of(&user_agent);
            log::debug!("{}: remote agent {} (generation {})", peer, user_agent, protocol);
            peer.set_remote_version(RemoteVersion {
                build_time,
                user_agent,
                protocol,
            })
            .await;

            if !peer.direction().is_outbound() {
                send_version(manager, peer).await?;
            }
            peer.set_handshake_state(HandshakeState::SelfCheck).await;
            if peer.direction().is_outbound() {
                peer.send(Message::new(Payload::PeerId(manager.peer_id())))
                    .await?;
            }
            Ok(())
        }

        Payload::PeerId(id) => {
            if id == manager.peer_id() {
                if peer.direction().is_outbound() {
                    // Remember the dialed address so candidate selection
                    // never picks it again this run.
                    manager.mark_self_address(peer.address());
                } else {
                    // Still answer with our id so the remote outbound side
                    // can make the same discovery before the session ends.
                    let _ = peer
                        .send(Message::new(Payload::PeerId(manager.peer_id())))
                        .await;
                }
                return Err(HandshakeError::SelfConnection);
            }

            peer.set_remote_peer_id(id).await;
            if !peer.direction().is_outbound() {
                peer.send(Message::new(Payload::PeerId(manager.peer_id())))
                    .await?;
            }

            let remote = peer.remote_protocol_version().await;
            match stage_after_self_check(PROTOCOL_VERSION, remote) {
                HandshakeState::Proof => {
                    peer.set_handshake_state(HandshakeState::Proof).await;
                    if peer.direction().is_outbound() {
                        send_proof(manager, peer).await?;
                    }
                    Ok(())
                }
                _ => complete(manager, peer).await,
            }
        }

        Payload::Proof {
            timestamp,
            salt,
            nonce,
        } => {
            if peer.direction().is_outbound() {
                // Confirmation echo; the salt bookkeeping happened on the
                // inbound side.
                manager
                    .pow()
                    .verify_echo(peer.connected_at(), timestamp, salt, nonce)?;
            } else {
                manager
                    .pow()
                    .verify(peer.connected_at(), timestamp, salt, nonce)?;
                peer.send(Message::new(Payload::Proof {
                    timestamp,
                    salt,
                    nonce,
                }))
                .await?;
            }
            complete(manager, peer).await
        }

        // Unreachable while expects() covers every non-terminal state, but
        // kept as a violation rather than a panic.
        _ => Err(HandshakeError::UnexpectedMessage { state, got: kind }),
    }
}

/// Which stage follows SELF_CHECK: PROOF only when both generations are
/// second or later, otherwise straight to COMPLETED.
fn stage_after_self_check(local: u32, remote: u32) -> HandshakeState {
    if local >= 2 && remote >= 2 {
        HandshakeState::Proof
    } else {
        HandshakeState::Completed
    }
}

async fn send_version(manager: &Arc<PeerManager>, peer: &Arc<Peer>) -> Result<(), HandshakeError> {
    peer.send(Message::new(Payload::Version {
        build_time: manager.build_time(),
        user_agent: USER_AGENT.to_string(),
    }))
    .await?;
    Ok(())
}

/// Solve and send our proof-of-work, stamped with this connection's start
/// time so the verifier's skew check lines up.
async fn send_proof(manager: &Arc<PeerManager>, peer: &Arc<Peer>) -> Result<(), HandshakeError> {
    let timestamp = peer.connected_at();
    let salt = ProofOfWork::random_salt();
    let nonce = manager
        .solve_proof(timestamp, salt)
        .await
        .ok_or(HandshakeError::Cancelled)?;
    peer.send(Message::new(Payload::Proof {
        timestamp,
        salt,
        nonce,
    }))
    .await?;
    Ok(())
}

/// Final stage: mark the session trusted, start keepalive, and greet the
/// peer with our chain height and a share of known addresses.
async fn complete(manager: &Arc<PeerManager>, peer: &Arc<Peer>) -> Result<(), HandshakeError> {
    peer.set_handshake_state(HandshakeState::Completed).await;
    let id = peer.remote_peer_id().await.map(|id| id.to_string());
    log::info!(
        "handshake complete with {} peer {} (id {})",
        peer.direction(),
        peer,
        id.as_deref().unwrap_or("?"),
    );

    if peer.direction().is_outbound() {
        manager.record_connection_success(peer.address());
    }

    peer.start_pings();

    let version = peer.remote_protocol_version().await;
    peer.send(Message::new(manager.height_payload(version)))
        .await?;
    peer.send(Message::new(manager.peers_payload(version).await))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_state_expects_one_type() {
        assert_eq!(HandshakeState::Started.expects(), None);
        assert_eq!(
            HandshakeState::Version.expects(),
            Some(MessageType::Version)
        );
        assert_eq!(
            HandshakeState::SelfCheck.expects(),
            Some(MessageType::PeerId)
        );
        assert_eq!(HandshakeState::Proof.expects(), Some(MessageType::Proof));
        assert_eq!(HandshakeState::Completed.expects(), None);
    }

    #[test]
    fn test_proof_stage_requires_both_generations() {
        assert_eq!(stage_after_self_check(2, 2), HandshakeState::Proof);
        assert_eq!(stage_after_self_check(2, 3), HandshakeState::Proof);
        assert_eq!(stage_after_self_check(2, 1), HandshakeState::Completed);
        assert_eq!(stage_after_self_check(1, 2), HandshakeState::Completed);
        assert_eq!(stage_after_self_check(1, 1), HandshakeState::Completed);
    }
}

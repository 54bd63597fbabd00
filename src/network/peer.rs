//! Peer connections
//!
//! One `Peer` per live session. Each connection runs two tasks: a reader
//! that decodes frames and routes them, and a writer that drains a channel
//! so whole frames are written without interleaving. Requests are
//! correlated to replies through single-slot inboxes keyed by correlation
//! id.

use super::address::PeerAddress;
use super::codec::MessageCodec;
use super::handshake::HandshakeState;
use super::manager::PeerManager;
use super::message::{Message, Payload, PeerId};
use crate::settings::Settings;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Outstanding messages the writer channel will buffer before senders wait.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Peer connection errors. All of them are fatal to the one connection.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("peer disconnected")]
    Disconnected,
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),
}

/// Who initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn is_outbound(self) -> bool {
        matches!(self, Direction::Outbound)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// What the remote reported in its VERSION message.
#[derive(Debug, Clone)]
pub struct RemoteVersion {
    pub build_time: i64,
    pub user_agent: String,
    pub protocol: u32,
}

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;
type MessageStream = SplitStream<Framed<TcpStream, MessageCodec>>;

/// I/O halves handed from [`Peer::wrap`] to [`Peer::launch`], so the owner
/// can register the peer before any task runs.
pub(crate) struct PeerIo {
    sink: MessageSink,
    stream: MessageStream,
    writer_rx: mpsc::Receiver<Message>,
}

/// One live connection to a remote node.
pub struct Peer {
    direction: Direction,
    socket_addr: SocketAddr,
    address: PeerAddress,
    connected_at: i64,
    settings: Arc<Settings>,
    writer_tx: mpsc::Sender<Message>,
    replies: Mutex<HashMap<u32, oneshot::Sender<Message>>>,
    handshake: RwLock<HandshakeState>,
    remote_version: RwLock<Option<RemoteVersion>>,
    remote_peer_id: RwLock<Option<PeerId>>,
    last_ping_ms: AtomicI64,
    closed: AtomicBool,
    cancel: CancellationToken,
    pinger: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Wrap a raw socket. The returned [`PeerIo`] must be passed to
    /// [`Peer::launch`] once the owner has registered the peer.
    pub(crate) fn wrap(
        stream: TcpStream,
        address: PeerAddress,
        direction: Direction,
        settings: Arc<Settings>,
    ) -> io::Result<(Arc<Self>, PeerIo)> {
        let socket_addr = stream.peer_addr()?;
        let (sink, stream) = Framed::new(stream, MessageCodec).split();
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let peer = Arc::new(Self {
            direction,
            socket_addr,
            address,
            connected_at: Utc::now().timestamp_millis(),
            settings,
            writer_tx,
            replies: Mutex::new(HashMap::new()),
            handshake: RwLock::new(HandshakeState::Started),
            remote_version: RwLock::new(None),
            remote_peer_id: RwLock::new(None),
            last_ping_ms: AtomicI64::new(-1),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            pinger: Mutex::new(None),
        });

        let io = PeerIo {
            sink,
            stream,
            writer_rx,
        };
        Ok((peer, io))
    }

    /// Start the reader and writer tasks for this connection.
    pub(crate) fn launch(self: &Arc<Self>, io: PeerIo, manager: Arc<PeerManager>) {
        let PeerIo {
            mut sink,
            mut stream,
            mut writer_rx,
        } = io;

        // Writer: sole owner of the sink. A frame is fully serialized and
        // flushed before the next is taken, so concurrent senders cannot
        // interleave bytes.
        let writer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer.cancel.cancelled() => break,
                    next = writer_rx.recv() => match next {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                writer.disconnect(&format!("write failed: {}", e));
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            // Dropping the sink closes the write half.
        });

        // Reader: decode, deliver correlated replies, route the rest. The
        // routing call runs on this task, so each connection processes its
        // inbound messages in arrival order.
        let reader = self.clone();
        tokio::spawn(async move {
            manager.on_peer_ready(&reader).await;
            loop {
                tokio::select! {
                    _ = reader.cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(message)) => {
                            log::trace!("{}: received {}", reader, message.kind());
                            if let Some(message) = reader.deliver_reply(message) {
                                manager.on_message(&reader, message).await;
                            }
                        }
                        Some(Err(e)) => {
                            reader.disconnect(&format!("protocol error: {}", e));
                            break;
                        }
                        None => {
                            reader.disconnect("remote closed the connection");
                            break;
                        }
                    }
                }
            }
            reader.disconnect("connection task ended");
            manager.on_disconnect(&reader).await;
        });
    }

    /// Queue a message for the writer task.
    pub async fn send(&self, message: Message) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PeerError::Disconnected);
        }
        self.writer_tx
            .send(message)
            .await
            .map_err(|_| PeerError::Disconnected)
    }

    /// Send a request and await its correlated reply.
    ///
    /// A random positive correlation id not currently in flight is
    /// registered with a single-slot inbox before sending; the slot is
    /// released on every exit path — reply, timeout, or send failure — so
    /// no registration can leak.
    pub async fn get_response(&self, payload: Payload) -> Result<Message, PeerError> {
        let (id, rx) = {
            let mut replies = lock(&self.replies);
            let mut rng = rand::thread_rng();
            let id = loop {
                let candidate: u32 = rng.gen_range(1..=i32::MAX as u32);
                if !replies.contains_key(&candidate) {
                    break candidate;
                }
            };
            let (tx, rx) = oneshot::channel();
            replies.insert(id, tx);
            (id, rx)
        };
        let _slot = ReplySlot { peer: self, id };

        self.send(Message::with_id(id, payload)).await?;

        match timeout(self.settings.response_timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(PeerError::Disconnected),
            Err(_) => Err(PeerError::ResponseTimeout(self.settings.response_timeout)),
        }
    }

    /// Hand a message to a waiting requester, if any. Returns the message
    /// back when nothing is waiting on its correlation id, in which case it
    /// belongs to the ordinary inbound path.
    fn deliver_reply(&self, message: Message) -> Option<Message> {
        let id = message.id?;
        let sender = lock(&self.replies).remove(&id);
        match sender {
            Some(tx) => match tx.send(message) {
                Ok(()) => None,
                // The requester gave up between timeout and unregistration.
                Err(message) => Some(message),
            },
            None => Some(message),
        }
    }

    /// Begin periodic keepalive. Called by the manager once the handshake
    /// has completed, never earlier.
    pub fn start_pings(self: &Arc<Self>) {
        let peer = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(peer.settings.ping_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                let started = Instant::now();
                match peer.get_response(Payload::Ping).await {
                    Ok(_) => {
                        let rtt = started.elapsed().as_millis() as i64;
                        peer.last_ping_ms.store(rtt, Ordering::Relaxed);
                        log::trace!("{}: ping {}ms", peer, rtt);
                    }
                    Err(e) => {
                        peer.disconnect(&format!("keepalive failed: {}", e));
                        break;
                    }
                }
            }
        });
        if let Some(old) = lock(&self.pinger).replace(handle) {
            old.abort();
        }
    }

    /// Tear the connection down. Idempotent; only the first call's reason
    /// is logged. Cancels both I/O tasks (closing the socket), drops any
    /// waiting reply slots, and stops the keepalive.
    pub fn disconnect(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("disconnecting {} peer {}: {}", self.direction, self, reason);
        self.cancel.cancel();
        if let Some(pinger) = lock(&self.pinger).take() {
            pinger.abort();
        }
        lock(&self.replies).clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// The dialed address for outbound peers, the observed socket address
    /// for inbound ones.
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Unix milliseconds when this connection was established; the proof-
    /// of-work timestamp is checked against it.
    pub fn connected_at(&self) -> i64 {
        self.connected_at
    }

    pub async fn handshake_state(&self) -> HandshakeState {
        *self.handshake.read().await
    }

    pub(crate) async fn set_handshake_state(&self, state: HandshakeState) {
        log::debug!("{}: handshake -> {:?}", self, state);
        *self.handshake.write().await = state;
    }

    pub async fn is_completed(&self) -> bool {
        self.handshake_state().await == HandshakeState::Completed
    }

    pub async fn remote_version(&self) -> Option<RemoteVersion> {
        self.remote_version.read().await.clone()
    }

    pub(crate) async fn set_remote_version(&self, version: RemoteVersion) {
        *self.remote_version.write().await = Some(version);
    }

    /// Negotiated protocol generation of the remote; oldest generation
    /// until a VERSION message has arrived.
    pub async fn remote_protocol_version(&self) -> u32 {
        self.remote_version
            .read()
            .await
            .as_ref()
            .map(|v| v.protocol)
            .unwrap_or(1)
    }

    pub async fn remote_peer_id(&self) -> Option<PeerId> {
        *self.remote_peer_id.read().await
    }

    pub(crate) async fn set_remote_peer_id(&self, id: PeerId) {
        *self.remote_peer_id.write().await = Some(id);
    }

    /// Round-trip time of the most recent keepalive, if any succeeded yet.
    pub fn last_ping_ms(&self) -> Option<i64> {
        match self.last_ping_ms.load(Ordering::Relaxed) {
            rtt if rtt >= 0 => Some(rtt),
            _ => None,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr)
    }
}

/// Unregisters a reply inbox when the request completes, times out, or
/// fails to send.
struct ReplySlot<'a> {
    peer: &'a Peer,
    id: u32,
}

impl Drop for ReplySlot<'_> {
    fn drop(&mut self) {
        lock(&self.peer.replies).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

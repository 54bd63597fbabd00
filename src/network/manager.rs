//! Peer manager
//!
//! Owns the listening socket, the bounded set of live connections, outbound
//! dialing with per-address backoff, periodic broadcasting, and the routing
//! of every inbound message: handshake traffic drives the state machine,
//! a handful of types are handled here, everything else goes up to the
//! domain collaborator.

use super::address::{PeerAddress, DEFAULT_PORT};
use super::handshake;
use super::message::{Message, Payload, PeerId};
use super::peer::{Direction, Peer, PeerError};
use super::pow::ProofOfWork;
use crate::chain::DomainAdapter;
use crate::settings::Settings;
use crate::store::PeerStore;
use chrono::Utc;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Connection and broadcast orchestrator. One instance per node process;
/// shared behind an [`Arc`] with every connection task.
pub struct PeerManager {
    settings: Arc<Settings>,
    domain: Arc<dyn DomainAdapter>,
    store: Arc<dyn PeerStore>,
    pow: Arc<ProofOfWork>,
    peer_id: PeerId,
    build_time: i64,
    peers: RwLock<HashMap<SocketAddr, Arc<Peer>>>,
    /// Addresses discovered to be this process itself. Grows for the
    /// lifetime of the run.
    self_addresses: Mutex<HashSet<PeerAddress>>,
    local_addr: Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
    shutdown: Arc<AtomicBool>,
}

impl PeerManager {
    pub fn new(
        settings: Settings,
        domain: Arc<dyn DomainAdapter>,
        store: Arc<dyn PeerStore>,
    ) -> Arc<Self> {
        let pow = Arc::new(ProofOfWork::new(
            settings.pow_difficulty,
            settings.proof_max_skew_ms,
        ));
        Arc::new(Self {
            settings: Arc::new(settings),
            domain,
            store,
            pow,
            peer_id: PeerId::random(),
            build_time: Utc::now().timestamp_millis(),
            peers: RwLock::new(HashMap::new()),
            self_addresses: Mutex::new(HashSet::new()),
            local_addr: Mutex::new(None),
            cancel: CancellationToken::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bind the listener and start the accept and maintenance loops. A
    /// bind failure is unrecoverable and surfaces to the caller.
    pub async fn start(self: &Arc<Self>) -> io::Result<SocketAddr> {
        let bind = SocketAddr::new(self.settings.bind_address, self.settings.listen_port);
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        *lock(&self.local_addr) = Some(local);
        log::info!("listening on {} (peer id {})", local, self.peer_id);

        let acceptor = self.clone();
        tokio::spawn(async move { acceptor.accept_loop(listener).await });

        let maintainer = self.clone();
        tokio::spawn(async move { maintainer.maintenance_loop().await });

        Ok(local)
    }

    /// Stop the loops, cancel any in-flight proof search, and disconnect
    /// every peer.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("network shutting down");
        self.cancel.cancel();
        let peers: Vec<_> = self.peers.read().await.values().cloned().collect();
        for peer in peers {
            peer.disconnect("shutting down");
        }
    }

    /// Dial an address right away, outside the candidate-selection cycle.
    pub async fn connect(self: &Arc<Self>, address: &PeerAddress) -> Result<(), PeerError> {
        let now = Utc::now().timestamp_millis();
        if let Err(e) = self.store.upsert(address, now) {
            log::warn!("peer store upsert failed: {}", e);
        }
        if let Err(e) = self.store.record_attempt(address, now) {
            log::warn!("peer store attempt bookkeeping failed: {}", e);
        }
        self.dial(address).await
    }

    // =========================================================================
    // Main loops
    // =========================================================================

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept_one(stream, addr).await,
                    Err(e) => log::warn!("accept failed: {}", e),
                }
            }
        }
        log::debug!("accept loop stopped");
    }

    async fn accept_one(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        // At capacity the socket is dropped before a single handshake byte
        // is exchanged.
        if self.peers.read().await.len() >= self.settings.max_peers {
            log::debug!(
                "refusing {} at capacity ({} peers)",
                addr,
                self.settings.max_peers
            );
            drop(stream);
            return;
        }
        log::info!("inbound connection from {}", addr);
        let address = PeerAddress::from_socket(addr);
        if let Err(e) = self.adopt(stream, address, Direction::Inbound).await {
            log::warn!("failed to adopt {}: {}", addr, e);
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut tick = interval(self.settings.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_broadcast = Instant::now();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            if self.peers.read().await.len() < self.settings.min_peers {
                self.dial_one().await;
            }

            if last_broadcast.elapsed() >= self.settings.broadcast_interval {
                last_broadcast = Instant::now();
                for message in self.domain.broadcast_messages() {
                    self.broadcast(message).await;
                }
            }
        }
        log::debug!("maintenance loop stopped");
    }

    /// Pick one dial candidate and attempt it. The attempt timestamp is
    /// recorded before dialing, so a failure quietly waits out the backoff.
    async fn dial_one(self: &Arc<Self>) {
        let candidate = match self.select_candidate().await {
            Some(candidate) => candidate,
            None => return,
        };
        let now = Utc::now().timestamp_millis();
        if let Err(e) = self.store.record_attempt(&candidate, now) {
            log::warn!("peer store attempt bookkeeping failed: {}", e);
            return;
        }
        if let Err(e) = self.dial(&candidate).await {
            log::debug!("dial {} failed: {}", candidate, e);
        }
    }

    /// Uniform random choice among known addresses that are outside the
    /// backoff window, not ourselves, and not already connected. A store
    /// failure aborts this cycle; the next tick retries.
    async fn select_candidate(&self) -> Option<PeerAddress> {
        let records = match self.store.known_peers() {
            Ok(records) => records,
            Err(e) => {
                log::warn!("peer store unavailable: {}", e);
                return None;
            }
        };

        let now = Utc::now().timestamp_millis();
        let backoff = self.settings.dial_backoff.as_millis() as i64;
        let connected: HashSet<PeerAddress> = self
            .peers
            .read()
            .await
            .values()
            .map(|peer| peer.address().clone())
            .collect();
        let selfs = lock(&self.self_addresses).clone();

        let candidates: Vec<PeerAddress> = records
            .into_iter()
            .filter(|record| {
                record
                    .last_attempt
                    .map_or(true, |attempted| now - attempted >= backoff)
            })
            .map(|record| record.address)
            .filter(|address| !selfs.contains(address) && !connected.contains(address))
            .collect();

        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    async fn dial(self: &Arc<Self>, address: &PeerAddress) -> Result<(), PeerError> {
        // Late resolution: names hit DNS only here.
        let socket = address
            .resolve()
            .await
            .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;
        log::debug!("dialing {} ({})", address, socket);
        let stream = timeout(self.settings.connect_timeout, TcpStream::connect(socket))
            .await
            .map_err(|_| PeerError::ConnectionFailed("connect timed out".to_string()))?
            .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;
        self.adopt(stream, address.clone(), Direction::Outbound)
            .await?;
        Ok(())
    }

    /// Register a fresh connection and start its I/O tasks. Registration
    /// happens first so a fast failure still finds its map entry to remove.
    async fn adopt(
        self: &Arc<Self>,
        stream: TcpStream,
        address: PeerAddress,
        direction: Direction,
    ) -> Result<(), PeerError> {
        let (peer, io) = Peer::wrap(stream, address, direction, self.settings.clone())?;
        self.peers
            .write()
            .await
            .insert(peer.socket_addr(), peer.clone());
        peer.launch(io, self.clone());
        Ok(())
    }

    // =========================================================================
    // Connection callbacks
    // =========================================================================

    /// I/O plumbing is up; let the handshake take its first step.
    pub(crate) async fn on_peer_ready(self: &Arc<Self>, peer: &Arc<Peer>) {
        if let Err(e) = handshake::on_ready(self, peer).await {
            peer.disconnect(&format!("handshake: {}", e));
        }
    }

    pub(crate) async fn on_disconnect(&self, peer: &Arc<Peer>) {
        let mut peers = self.peers.write().await;
        peers.remove(&peer.socket_addr());
        log::debug!("{} removed, {} peers live", peer, peers.len());
    }

    /// Route one inbound message from a connection's reader task.
    pub(crate) async fn on_message(self: &Arc<Self>, peer: &Arc<Peer>, message: Message) {
        if !peer.is_completed().await {
            if let Err(e) = handshake::on_message(self, peer, message).await {
                peer.disconnect(&format!("handshake: {}", e));
            }
            return;
        }

        let id = message.id;
        match message.payload {
            // A pong is a PING echoed back under the caller's id.
            Payload::Ping => {
                let reply = match id {
                    Some(id) => Message::with_id(id, Payload::Ping),
                    None => Message::new(Payload::Ping),
                };
                if peer.send(reply).await.is_err() {
                    peer.disconnect("pong send failed");
                }
            }
            Payload::GetPeers => {
                let version = peer.remote_protocol_version().await;
                let payload = self.peers_payload(version).await;
                let reply = match id {
                    Some(id) => Message::with_id(id, payload),
                    None => Message::new(payload),
                };
                if peer.send(reply).await.is_err() {
                    peer.disconnect("peer list send failed");
                }
            }
            Payload::Peers(addrs) => self.merge_legacy_peers(addrs),
            Payload::PeersV2(addrs) => self.merge_peers_v2(peer, addrs),
            // Everything else belongs to the consensus/mempool layer.
            payload => self.domain.on_message(peer, Message { id, payload }),
        }
    }

    // =========================================================================
    // Peer-list exchange
    // =========================================================================

    /// Snapshot of handshake-completed outbound peers, shaped for the
    /// requester's generation. The first V2 entry advertises our own
    /// listening port.
    pub async fn peers_payload(&self, version: u32) -> Payload {
        let peers = self.peers.read().await;
        let mut connected = Vec::new();
        for peer in peers.values() {
            if peer.direction().is_outbound() && peer.is_completed().await {
                connected.push(peer.address().clone());
            }
        }
        drop(peers);

        if version >= 2 {
            let mut list = vec![PeerAddress::new("0.0.0.0", self.listen_port())];
            list.extend(connected);
            Payload::PeersV2(list)
        } else {
            Payload::Peers(connected.iter().filter_map(PeerAddress::ipv4).collect())
        }
    }

    /// Our current chain tip, shaped for the peer's generation.
    pub fn height_payload(&self, version: u32) -> Payload {
        let tip = self.domain.chain_tip();
        if version >= 2 {
            Payload::HeightV2 {
                height: tip.height,
                signature: tip.signature,
                timestamp: tip.timestamp,
                generator: tip.generator,
            }
        } else {
            Payload::Height(tip.height)
        }
    }

    fn merge_legacy_peers(&self, addrs: Vec<Ipv4Addr>) {
        let learned = addrs
            .into_iter()
            .map(|ip| PeerAddress::new(ip.to_string(), DEFAULT_PORT))
            .collect();
        self.merge_addresses(learned);
    }

    fn merge_peers_v2(&self, peer: &Peer, addrs: Vec<PeerAddress>) {
        let mut entries = addrs.into_iter();
        let mut learned = Vec::new();
        // The first entry advertises the sender's listening port on a
        // wildcard host; combine it with the address we actually see.
        if let Some(first) = entries.next() {
            learned.push(PeerAddress::new(
                peer.socket_addr().ip().to_string(),
                first.port(),
            ));
        }
        learned.extend(entries);
        self.merge_addresses(learned);
    }

    /// Merge newly learned addresses into the store, skipping ones already
    /// known and our own. Store failures abort the merge cycle.
    fn merge_addresses(&self, addrs: Vec<PeerAddress>) {
        let known: HashSet<PeerAddress> = match self.store.known_peers() {
            Ok(records) => records.into_iter().map(|record| record.address).collect(),
            Err(e) => {
                log::warn!("peer store unavailable, dropping learned addresses: {}", e);
                return;
            }
        };
        let selfs = lock(&self.self_addresses).clone();
        let now = Utc::now().timestamp_millis();

        let mut added = 0;
        for address in addrs {
            if known.contains(&address) || selfs.contains(&address) {
                continue;
            }
            match self.store.upsert(&address, now) {
                Ok(()) => added += 1,
                Err(e) => {
                    log::warn!("peer store upsert failed: {}", e);
                    return;
                }
            }
        }
        if added > 0 {
            log::debug!("learned {} new peer addresses", added);
        }
    }

    // =========================================================================
    // Shared state
    // =========================================================================

    /// Fan a message out to every handshake-completed peer; peers whose
    /// send fails are disconnected.
    pub async fn broadcast(&self, message: Message) {
        let peers: Vec<Arc<Peer>> = self.peers.read().await.values().cloned().collect();
        for peer in peers {
            if !peer.is_completed().await {
                continue;
            }
            if peer.send(message.clone()).await.is_err() {
                peer.disconnect("broadcast send failed");
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    /// This process's random identity token.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub(crate) fn build_time(&self) -> i64 {
        self.build_time
    }

    pub(crate) fn pow(&self) -> &ProofOfWork {
        &self.pow
    }

    /// Run the nonce search off the async runtime; returns `None` when
    /// shutdown interrupts it.
    pub(crate) async fn solve_proof(&self, timestamp: i64, salt: u64) -> Option<u64> {
        let pow = self.pow.clone();
        let cancel = self.shutdown.clone();
        tokio::task::spawn_blocking(move || pow.solve(timestamp, salt, &cancel))
            .await
            .unwrap_or(None)
    }

    /// Record an address as our own; it is excluded from candidate
    /// selection for the rest of the run.
    pub(crate) fn mark_self_address(&self, address: &PeerAddress) {
        log::info!("learned own address {}", address);
        lock(&self.self_addresses).insert(address.clone());
    }

    pub fn is_self_address(&self, address: &PeerAddress) -> bool {
        lock(&self.self_addresses).contains(address)
    }

    pub(crate) fn record_connection_success(&self, address: &PeerAddress) {
        let now = Utc::now().timestamp_millis();
        if let Err(e) = self.store.record_success(address, now) {
            log::warn!("peer store success bookkeeping failed: {}", e);
        }
    }

    fn listen_port(&self) -> u16 {
        lock(&self.local_addr)
            .map(|addr| addr.port())
            .unwrap_or(self.settings.listen_port)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

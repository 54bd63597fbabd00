//! Node configuration
//!
//! Plain settings struct consumed by the networking layer. Callers build
//! one with struct-update syntax over [`Settings::default`].

use crate::network::address::DEFAULT_PORT;
use crate::network::pow::{DEFAULT_DIFFICULTY, DEFAULT_MAX_SKEW_MS};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Tunable knobs of the peer-to-peer layer.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Interface the listener binds to.
    pub bind_address: IpAddr,
    /// Listening port; 0 lets the OS pick one.
    pub listen_port: u16,
    /// Dial new peers while the live count is below this.
    pub min_peers: usize,
    /// Inbound connections past this are refused before any handshake.
    pub max_peers: usize,
    /// Leading zero bytes required of a proof-of-work digest.
    pub pow_difficulty: usize,
    /// Permitted skew between a proof timestamp and the connection start.
    pub proof_max_skew_ms: i64,
    /// Minimum wait before re-dialing an address after an attempt.
    pub dial_backoff: Duration,
    /// Upper bound on establishing an outbound TCP connection.
    pub connect_timeout: Duration,
    /// Upper bound on awaiting a correlated response.
    pub response_timeout: Duration,
    /// Keepalive cadence once a handshake has completed.
    pub ping_interval: Duration,
    /// Cadence of the manager's accept/dial/broadcast maintenance cycle.
    pub tick_interval: Duration,
    /// Cadence of the domain collaborator's broadcast hook.
    pub broadcast_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_PORT,
            min_peers: 3,
            max_peers: 8,
            pow_difficulty: DEFAULT_DIFFICULTY,
            proof_max_skew_ms: DEFAULT_MAX_SKEW_MS,
            dial_backoff: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(20),
            tick_interval: Duration::from_secs(1),
            broadcast_interval: Duration::from_secs(60),
        }
    }
}

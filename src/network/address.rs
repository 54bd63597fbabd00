//! Peer addresses
//!
//! Addresses are kept as `host:port` strings and only resolved to socket
//! addresses at dial time, so DNS changes between attempts are picked up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::lookup_host;

/// Default listen/dial port when an address string carries none.
pub const DEFAULT_PORT: u16 = 9784;

/// Address parsing errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty host")]
    EmptyHost,
    #[error("unterminated '[' in address: {0}")]
    UnterminatedBracket(String),
    #[error("invalid port in address: {0}")]
    InvalidPort(String),
}

/// A peer endpoint as a host name or literal IP plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string.
    ///
    /// Literal IPv6 hosts must be bracketed when a port is given
    /// (`[::1]:9784`); an unbracketed string containing several colons is
    /// taken as a bare IPv6 host with the default port. A bare host or a
    /// bracketed host without a port gets [`DEFAULT_PORT`].
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::EmptyHost);
        }

        if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| AddressError::UnterminatedBracket(s.to_string()))?;
            let host = &rest[..end];
            if host.is_empty() {
                return Err(AddressError::EmptyHost);
            }
            let tail = &rest[end + 1..];
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse::<u16>()
                    .map_err(|_| AddressError::InvalidPort(s.to_string()))?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(AddressError::InvalidPort(s.to_string())),
            };
            return Ok(Self::new(host, port));
        }

        // More than one colon without brackets: a bare IPv6 literal.
        if s.matches(':').count() > 1 {
            return Ok(Self::new(s, DEFAULT_PORT));
        }

        match s.split_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(AddressError::EmptyHost);
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same host, different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }

    /// Build from an already-resolved socket address.
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }

    /// Whether the host is an IPv4 literal (usable in legacy PEERS payloads).
    pub fn ipv4(&self) -> Option<std::net::Ipv4Addr> {
        self.host.parse().ok()
    }

    /// Resolve to a socket address. Host names go through DNS here and
    /// nowhere earlier.
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        // Literal IPs skip the resolver entirely.
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses for {}", self.host),
                )
            })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let addr = PeerAddress::parse("node.example.com:9784").unwrap();
        assert_eq!(addr.host(), "node.example.com");
        assert_eq!(addr.port(), 9784);
    }

    #[test]
    fn test_parse_bare_host_gets_default_port() {
        let addr = PeerAddress::parse("10.1.2.3").unwrap();
        assert_eq!(addr.host(), "10.1.2.3");
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let addr = PeerAddress::parse("[2001:db8::1]:9000").unwrap();
        assert_eq!(addr.host(), "2001:db8::1");
        assert_eq!(addr.port(), 9000);

        let addr = PeerAddress::parse("[::1]").unwrap();
        assert_eq!(addr.host(), "::1");
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_parse_unbracketed_ipv6_is_bare_host() {
        let addr = PeerAddress::parse("2001:db8::1").unwrap();
        assert_eq!(addr.host(), "2001:db8::1");
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(PeerAddress::parse(""), Err(AddressError::EmptyHost));
        assert_eq!(PeerAddress::parse(":9784"), Err(AddressError::EmptyHost));
        assert!(matches!(
            PeerAddress::parse("host:notaport"),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            PeerAddress::parse("[::1"),
            Err(AddressError::UnterminatedBracket(_))
        ));
        assert!(matches!(
            PeerAddress::parse("[::1]9000"),
            Err(AddressError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_display_brackets_ipv6() {
        let addr = PeerAddress::new("2001:db8::1", 9000);
        assert_eq!(addr.to_string(), "[2001:db8::1]:9000");
        assert_eq!(PeerAddress::parse(&addr.to_string()).unwrap(), addr);

        let addr = PeerAddress::new("127.0.0.1", 9784);
        assert_eq!(addr.to_string(), "127.0.0.1:9784");
    }

    #[tokio::test]
    async fn test_resolve_literal_ip() {
        let addr = PeerAddress::new("127.0.0.1", 9784);
        let socket = addr.resolve().await.unwrap();
        assert_eq!(socket, "127.0.0.1:9784".parse().unwrap());
    }
}

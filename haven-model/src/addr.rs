//! Peer multiaddresses
//!
//! A peer is reachable at a self-describing textual address of the form
//! `/dns4/<onion>.onion/tcp/<port>/wss/p2p/<peer-id>`, where the peer id
//! is the hex-encoded Ed25519 public key. Addresses round-trip losslessly
//! through parse/serialize, which makes them safe to persist and to
//! exchange between implementations.

use crate::onion::{OnionAddress, OnionError};
use crate::types::{ByteParseError, PubKey};
use thiserror::Error;

/// Default websocket port for peer endpoints.
pub const DEFAULT_PEER_PORT: u16 = 443;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("malformed peer address: {0}")]
    Malformed(String),

    #[error("invalid onion host: {0}")]
    Onion(#[from] OnionError),

    #[error("invalid peer id: {0}")]
    PeerId(#[from] ByteParseError),

    #[error("invalid port: {0}")]
    Port(String),
}

/// A parsed peer multiaddress.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub onion: OnionAddress,
    pub port: u16,
    pub peer_id: PubKey,
}

impl PeerAddress {
    pub fn new(onion: OnionAddress, peer_id: PubKey) -> Self {
        Self {
            onion,
            port: DEFAULT_PEER_PORT,
            peer_id,
        }
    }

    /// Parse the canonical textual form.
    pub fn parse(s: &str) -> Result<Self, AddrError> {
        let mut parts = s.split('/');
        let malformed = || AddrError::Malformed(s.to_string());

        if parts.next() != Some("") {
            return Err(malformed());
        }
        if parts.next() != Some("dns4") {
            return Err(malformed());
        }
        let host = parts.next().ok_or_else(malformed)?;
        let onion_id = host
            .strip_suffix(".onion")
            .ok_or_else(malformed)?;
        let onion = OnionAddress::parse(onion_id)?;

        if parts.next() != Some("tcp") {
            return Err(malformed());
        }
        let port_str = parts.next().ok_or_else(malformed)?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddrError::Port(port_str.to_string()))?;

        if parts.next() != Some("wss") {
            return Err(malformed());
        }
        if parts.next() != Some("p2p") {
            return Err(malformed());
        }
        let peer_id = PubKey::from_hex(parts.next().ok_or_else(malformed)?)?;

        if parts.next().is_some() {
            return Err(malformed());
        }

        Ok(Self {
            onion,
            port,
            peer_id,
        })
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "/dns4/{}.onion/tcp/{}/wss/p2p/{}",
            self.onion,
            self.port,
            self.peer_id.to_hex()
        )
    }
}

impl std::fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerAddress({})", self)
    }
}

impl std::str::FromStr for PeerAddress {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, AddrError> {
        Self::parse(s)
    }
}

/// Deduplicate addresses, preserving first-occurrence order.
pub fn dedup_addresses(addresses: Vec<PeerAddress>) -> Vec<PeerAddress> {
    let mut seen = std::collections::HashSet::new();
    addresses
        .into_iter()
        .filter(|a| seen.insert(a.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(peer_byte: u8) -> PeerAddress {
        PeerAddress::new(
            OnionAddress::from_public_key(&PubKey::new([peer_byte; 32])),
            PubKey::new([peer_byte; 32]),
        )
    }

    #[test]
    fn display_parse_round_trip() {
        let addr = sample(5);
        let text = addr.to_string();
        assert!(text.starts_with("/dns4/"));
        assert!(text.contains(".onion/tcp/443/wss/p2p/"));
        assert_eq!(PeerAddress::parse(&text).unwrap(), addr);
    }

    #[test]
    fn parse_rejects_missing_p2p_segment() {
        let onion = OnionAddress::from_public_key(&PubKey::new([1; 32]));
        let text = format!("/dns4/{}.onion/tcp/443/wss", onion);
        assert!(matches!(
            PeerAddress::parse(&text),
            Err(AddrError::Malformed(_))
        ));
    }

    #[test]
    fn parse_rejects_bad_port() {
        let onion = OnionAddress::from_public_key(&PubKey::new([1; 32]));
        let peer = PubKey::new([2; 32]).to_hex();
        let text = format!("/dns4/{}.onion/tcp/99999/wss/p2p/{}", onion, peer);
        assert!(matches!(PeerAddress::parse(&text), Err(AddrError::Port(_))));
    }

    #[test]
    fn parse_rejects_trailing_segments() {
        let text = format!("{}/extra", sample(3));
        assert!(matches!(
            PeerAddress::parse(&text),
            Err(AddrError::Malformed(_))
        ));
    }

    #[test]
    fn dedup_preserves_order() {
        let a = sample(1);
        let b = sample(2);
        let deduped = dedup_addresses(vec![a.clone(), b.clone(), a.clone()]);
        assert_eq!(deduped, vec![a, b]);
    }
}

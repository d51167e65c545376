//! Persisted records
//!
//! Prost messages for everything the local database stores: the community
//! a device belongs to, its network identity, and per-peer connection
//! statistics. Prost gives these a deterministic binary encoding, the
//! same codec the replicated log uses.

use std::collections::HashMap;

/// A community this device created or joined.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommunityRecord {
    /// Stable community identifier.
    #[prost(string, tag = "1")]
    pub id: String,

    /// Known peer addresses in priority order (textual multiaddresses).
    #[prost(string, repeated, tag = "2")]
    pub peer_list: Vec<String>,

    /// Optional trust anchor (PEM).
    #[prost(string, optional, tag = "3")]
    pub root_ca: Option<String>,
}

/// An onion service: its address and the opaque key blob the control
/// channel returned, replayed verbatim to re-provision the same address.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HiddenServiceRecord {
    #[prost(string, tag = "1")]
    pub address: String,

    #[prost(string, tag = "2")]
    pub private_key: String,
}

/// A device's identity within one community.
#[derive(Clone, PartialEq, prost::Message)]
pub struct IdentityRecord {
    #[prost(string, tag = "1")]
    pub community_id: String,

    /// Ed25519 secret key bytes (see `DeviceIdentity`).
    #[prost(bytes = "vec", tag = "2")]
    pub secret_key: Vec<u8>,

    #[prost(message, optional, tag = "3")]
    pub hidden_service: Option<HiddenServiceRecord>,

    #[prost(string, tag = "4")]
    pub nickname: String,

    /// Pending certificate signing request, if registration is in flight.
    #[prost(string, optional, tag = "5")]
    pub user_csr: Option<String>,
}

/// Connection statistics for one remote peer address.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PeerStatsEntry {
    /// Hex-encoded public key of the peer seen at this address.
    #[prost(string, tag = "1")]
    pub peer_id: String,

    /// Total seconds spent connected across sessions.
    #[prost(uint64, tag = "2")]
    pub connection_time_secs: u64,

    /// Last observed activity, milliseconds since the Unix epoch.
    /// Only ever moves forward.
    #[prost(uint64, tag = "3")]
    pub last_seen_ms: u64,
}

/// All peer statistics, keyed by textual peer address.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PeerStatsMap {
    #[prost(map = "string, message", tag = "1")]
    pub entries: HashMap<String, PeerStatsEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn community_record_round_trip() {
        let record = CommunityRecord {
            id: "rust-community".into(),
            peer_list: vec!["/dns4/x.onion/tcp/443/wss/p2p/ab".into()],
            root_ca: None,
        };
        let bytes = record.encode_to_vec();
        assert_eq!(CommunityRecord::decode(&bytes[..]).unwrap(), record);
    }

    #[test]
    fn peer_stats_map_round_trip() {
        let mut map = PeerStatsMap::default();
        map.entries.insert(
            "/dns4/x.onion/tcp/443/wss/p2p/ab".into(),
            PeerStatsEntry {
                peer_id: "ab".into(),
                connection_time_secs: 50,
                last_seen_ms: 1_000,
            },
        );
        let bytes = map.encode_to_vec();
        let decoded = PeerStatsMap::decode(&bytes[..]).unwrap();
        assert_eq!(decoded.entries.len(), 1);
        assert_eq!(decoded, map);
    }
}

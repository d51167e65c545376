//! Peer connectivity events
//!
//! Emitted by the transport layer exactly once per physical transition
//! and consumed as idempotent upserts into persisted peer statistics.

use crate::types::PubKey;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// A connection to `peer` was established.
    Connected { peer: PubKey, timestamp_ms: u64 },

    /// The connection to `peer` closed after `connection_secs` seconds.
    Disconnected {
        peer: PubKey,
        connection_secs: u64,
        last_seen_ms: u64,
    },
}

impl PeerEvent {
    pub fn peer(&self) -> PubKey {
        match self {
            PeerEvent::Connected { peer, .. } => *peer,
            PeerEvent::Disconnected { peer, .. } => *peer,
        }
    }
}

//! Durable recovery state
//!
//! A single redb table over a fixed, enumerated key space. There are no
//! cross-key transactions; callers order writes so a crash mid-sequence
//! never leaves `currentCommunityId` pointing at a missing community,
//! and boot-time reads tolerate such a dangling pointer anyway.
//!
//! Peer statistics are read-modify-write and serialized behind a single
//! async writer so concurrent connect/disconnect events cannot lose
//! updates.

use haven_model::psk::PskError;
use haven_model::records::{CommunityRecord, IdentityRecord, PeerStatsEntry, PeerStatsMap};
use haven_model::NetworkKey;
use prost::Message;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;

const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("state");

/// Local I/O failures threaten recovery invariants, so they are always
/// surfaced, never swallowed.
#[derive(Error, Debug)]
pub enum LocalDbError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("corrupt record under {key}: {detail}")]
    Corrupt { key: &'static str, detail: String },
}

/// The enumerated key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKey {
    CurrentCommunityId,
    Community,
    Identity,
    Peers,
    Psk,
}

impl StateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::CurrentCommunityId => "currentCommunityId",
            StateKey::Community => "community",
            StateKey::Identity => "identity",
            StateKey::Peers => "peers",
            StateKey::Psk => "psk",
        }
    }
}

/// Durable local key/value store for recovery state.
pub struct LocalDb {
    db: Database,
    /// Serializes read-modify-write cycles on the peers record.
    peers_write: Mutex<()>,
}

impl LocalDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LocalDbError> {
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(STATE_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            peers_write: Mutex::new(()),
        })
    }

    // ==================== Raw key space ====================

    pub fn get(&self, key: StateKey) -> Result<Option<Vec<u8>>, LocalDbError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STATE_TABLE)?;
        Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
    }

    pub fn put(&self, key: StateKey, value: &[u8]) -> Result<(), LocalDbError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(STATE_TABLE)?;
            table.insert(key.as_str(), value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn delete(&self, key: StateKey) -> Result<(), LocalDbError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(STATE_TABLE)?;
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ==================== Typed accessors ====================

    pub fn current_community_id(&self) -> Result<Option<String>, LocalDbError> {
        Ok(self
            .get(StateKey::CurrentCommunityId)?
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string()))
    }

    pub fn set_current_community_id(&self, id: &str) -> Result<(), LocalDbError> {
        self.put(StateKey::CurrentCommunityId, id.as_bytes())
    }

    pub fn community(&self) -> Result<Option<CommunityRecord>, LocalDbError> {
        self.get(StateKey::Community)?
            .map(|bytes| {
                CommunityRecord::decode(&bytes[..]).map_err(|e| LocalDbError::Corrupt {
                    key: StateKey::Community.as_str(),
                    detail: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn set_community(&self, community: &CommunityRecord) -> Result<(), LocalDbError> {
        self.put(StateKey::Community, &community.encode_to_vec())
    }

    pub fn identity(&self) -> Result<Option<IdentityRecord>, LocalDbError> {
        self.get(StateKey::Identity)?
            .map(|bytes| {
                IdentityRecord::decode(&bytes[..]).map_err(|e| LocalDbError::Corrupt {
                    key: StateKey::Identity.as_str(),
                    detail: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn set_identity(&self, identity: &IdentityRecord) -> Result<(), LocalDbError> {
        self.put(StateKey::Identity, &identity.encode_to_vec())
    }

    pub fn psk(&self) -> Result<Option<NetworkKey>, LocalDbError> {
        self.get(StateKey::Psk)?
            .map(|bytes| {
                let encoded = String::from_utf8_lossy(&bytes);
                NetworkKey::from_base64(&encoded).map_err(|e: PskError| LocalDbError::Corrupt {
                    key: StateKey::Psk.as_str(),
                    detail: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn set_psk(&self, psk: &NetworkKey) -> Result<(), LocalDbError> {
        self.put(StateKey::Psk, psk.to_base64().as_bytes())
    }

    // ==================== Peer statistics ====================

    pub fn peer_stats(&self) -> Result<PeerStatsMap, LocalDbError> {
        self.get(StateKey::Peers)?
            .map(|bytes| {
                PeerStatsMap::decode(&bytes[..]).map_err(|e| LocalDbError::Corrupt {
                    key: StateKey::Peers.as_str(),
                    detail: e.to_string(),
                })
            })
            .transpose()
            .map(|m| m.unwrap_or_default())
    }

    /// Upsert on connect: ensures exactly one entry per address and
    /// moves `last_seen` forward, never back.
    pub async fn record_peer_connected(
        &self,
        address: &str,
        peer_id: &str,
        timestamp_ms: u64,
    ) -> Result<(), LocalDbError> {
        let _guard = self.peers_write.lock().await;
        let mut stats = self.peer_stats()?;
        let entry = stats
            .entries
            .entry(address.to_string())
            .or_insert_with(|| PeerStatsEntry {
                peer_id: peer_id.to_string(),
                connection_time_secs: 0,
                last_seen_ms: 0,
            });
        entry.peer_id = peer_id.to_string();
        entry.last_seen_ms = entry.last_seen_ms.max(timestamp_ms);
        self.put(StateKey::Peers, &stats.encode_to_vec())
    }

    /// Upsert on disconnect. Idempotent: re-applying a disconnect that
    /// moved `last_seen` no further is a no-op, never a duplicate entry
    /// and never double-counted connection time.
    pub async fn record_peer_disconnected(
        &self,
        address: &str,
        peer_id: &str,
        connection_secs: u64,
        last_seen_ms: u64,
    ) -> Result<(), LocalDbError> {
        let _guard = self.peers_write.lock().await;
        let mut stats = self.peer_stats()?;
        let entry = stats
            .entries
            .entry(address.to_string())
            .or_insert_with(|| PeerStatsEntry {
                peer_id: peer_id.to_string(),
                connection_time_secs: 0,
                last_seen_ms: 0,
            });
        if last_seen_ms <= entry.last_seen_ms && entry.connection_time_secs > 0 {
            return Ok(());
        }
        entry.peer_id = peer_id.to_string();
        entry.connection_time_secs += connection_secs;
        entry.last_seen_ms = entry.last_seen_ms.max(last_seen_ms);
        self.put(StateKey::Peers, &stats.encode_to_vec())
    }

    /// The community's peer list reordered most-recently-seen first.
    /// Addresses without stats keep their relative order at the end.
    pub fn peer_list_sorted_by_last_seen(
        &self,
        community: &CommunityRecord,
    ) -> Result<Vec<String>, LocalDbError> {
        let stats = self.peer_stats()?;
        let mut list = community.peer_list.clone();
        list.sort_by_key(|addr| {
            std::cmp::Reverse(stats.entries.get(addr).map(|e| e.last_seen_ms).unwrap_or(0))
        });
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db() -> (tempfile::TempDir, LocalDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = LocalDb::open(tmp.path().join("local.db")).unwrap();
        (tmp, db)
    }

    #[test]
    fn raw_key_space_round_trip() {
        let (_tmp, db) = open_db();
        assert_eq!(db.get(StateKey::Psk).unwrap(), None);
        db.put(StateKey::Psk, b"secret").unwrap();
        assert_eq!(db.get(StateKey::Psk).unwrap(), Some(b"secret".to_vec()));
        db.delete(StateKey::Psk).unwrap();
        assert_eq!(db.get(StateKey::Psk).unwrap(), None);
    }

    #[test]
    fn community_round_trip() {
        let (_tmp, db) = open_db();
        assert!(db.community().unwrap().is_none());

        let community = CommunityRecord {
            id: "rust-community".into(),
            peer_list: vec!["/dns4/a.onion/tcp/443/wss/p2p/aa".into()],
            root_ca: Some("pem".into()),
        };
        db.set_community(&community).unwrap();
        assert_eq!(db.community().unwrap(), Some(community));
    }

    #[test]
    fn psk_is_stored_base64() {
        let (_tmp, db) = open_db();
        let psk = NetworkKey::from_bytes([3; 32]);
        db.set_psk(&psk).unwrap();

        let raw = db.get(StateKey::Psk).unwrap().unwrap();
        assert_eq!(raw, psk.to_base64().as_bytes());
        assert_eq!(db.psk().unwrap(), Some(psk));
    }

    #[tokio::test]
    async fn connect_then_disconnect_accumulates_stats() {
        let (_tmp, db) = open_db();
        db.record_peer_connected("/addr/1", "aabb", 1_000).await.unwrap();
        db.record_peer_disconnected("/addr/1", "aabb", 50, 51_000)
            .await
            .unwrap();

        let stats = db.peer_stats().unwrap();
        let entry = &stats.entries["/addr/1"];
        assert_eq!(entry.peer_id, "aabb");
        assert_eq!(entry.connection_time_secs, 50);
        assert_eq!(entry.last_seen_ms, 51_000);
    }

    #[tokio::test]
    async fn reapplied_disconnect_is_a_noop() {
        let (_tmp, db) = open_db();
        db.record_peer_disconnected("/addr/1", "aabb", 50, 51_000)
            .await
            .unwrap();
        db.record_peer_disconnected("/addr/1", "aabb", 50, 51_000)
            .await
            .unwrap();

        let stats = db.peer_stats().unwrap();
        assert_eq!(stats.entries.len(), 1);
        assert_eq!(stats.entries["/addr/1"].connection_time_secs, 50);
    }

    #[tokio::test]
    async fn last_seen_is_monotonic() {
        let (_tmp, db) = open_db();
        db.record_peer_connected("/addr/1", "aabb", 90_000).await.unwrap();
        // A late-arriving older event cannot move last_seen back.
        db.record_peer_connected("/addr/1", "aabb", 10_000).await.unwrap();
        assert_eq!(db.peer_stats().unwrap().entries["/addr/1"].last_seen_ms, 90_000);
    }

    #[tokio::test]
    async fn peer_list_sorted_by_recency() {
        let (_tmp, db) = open_db();
        db.record_peer_connected("/addr/old", "aa", 1_000).await.unwrap();
        db.record_peer_connected("/addr/new", "bb", 9_000).await.unwrap();

        let community = CommunityRecord {
            id: "c".into(),
            peer_list: vec![
                "/addr/never".into(),
                "/addr/old".into(),
                "/addr/new".into(),
            ],
            root_ca: None,
        };
        assert_eq!(
            db.peer_list_sorted_by_last_seen(&community).unwrap(),
            vec![
                "/addr/new".to_string(),
                "/addr/old".to_string(),
                "/addr/never".to_string()
            ]
        );
    }
}

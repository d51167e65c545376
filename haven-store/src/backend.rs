//! Storage backend contract
//!
//! The store persists three things through this seam: the raw entry log
//! (append-only, keyed by entry id), the current DAG head set, and the
//! key index holding each key's winning entry. Implementations are
//! swappable without changing observable store semantics.

use crate::entry::{EntryError, SignedEntry};
use haven_model::types::Hash;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
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

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

impl From<EntryError> for BackendError {
    fn from(err: EntryError) -> Self {
        BackendError::Corrupt(err.to_string())
    }
}

/// The winning entry for a key in the materialized view.
#[derive(Clone, PartialEq, prost::Message)]
pub struct IndexSlot {
    #[prost(uint64, tag = "1")]
    pub depth: u64,

    #[prost(bytes = "vec", tag = "2")]
    pub entry_id: Vec<u8>,

    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,
}

impl IndexSlot {
    /// Merge ordering: deeper in causal order wins, ties break on the
    /// entry id bytes. Total and identical on every replica.
    pub fn beats(&self, other: &IndexSlot) -> bool {
        (self.depth, &self.entry_id) > (other.depth, &other.entry_id)
    }
}

/// Durable storage for one replicated store.
pub trait StorageBackend: Send + Sync + 'static {
    /// Append an entry to the raw log. Appending an id that already
    /// exists is a no-op.
    fn append_entry(&self, id: &Hash, entry: &SignedEntry) -> Result<(), BackendError>;

    fn get_entry(&self, id: &Hash) -> Result<Option<SignedEntry>, BackendError>;

    fn has_entry(&self, id: &Hash) -> Result<bool, BackendError>;

    /// All entry ids in the raw log (rejected entries included).
    fn entry_ids(&self) -> Result<Vec<Hash>, BackendError>;

    /// Current DAG head set.
    fn heads(&self) -> Result<Vec<Hash>, BackendError>;

    fn set_heads(&self, heads: &[Hash]) -> Result<(), BackendError>;

    fn index_get(&self, key: &str) -> Result<Option<IndexSlot>, BackendError>;

    fn index_put(&self, key: &str, slot: &IndexSlot) -> Result<(), BackendError>;

    fn index_delete(&self, key: &str) -> Result<(), BackendError>;

    /// Full index snapshot, sorted by key.
    fn index_all(&self) -> Result<Vec<(String, IndexSlot)>, BackendError>;

    /// Drop the whole index (used when rebuilding the view from the log).
    fn index_clear(&self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(depth: u64, id_byte: u8) -> IndexSlot {
        IndexSlot {
            depth,
            entry_id: vec![id_byte; 32],
            value: vec![],
        }
    }

    #[test]
    fn deeper_slot_wins() {
        assert!(slot(2, 0).beats(&slot(1, 9)));
        assert!(!slot(1, 9).beats(&slot(2, 0)));
    }

    #[test]
    fn equal_depth_breaks_on_entry_id() {
        assert!(slot(3, 9).beats(&slot(3, 1)));
        assert!(!slot(3, 1).beats(&slot(3, 9)));
    }
}

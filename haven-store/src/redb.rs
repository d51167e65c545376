//! Durable storage backend on redb
//!
//! Tables:
//! - `entries`: entry id → signed entry bytes (raw log)
//! - `heads`: entry id → [] (current DAG head set)
//! - `index`: key → IndexSlot bytes (materialized view)

use crate::backend::{BackendError, IndexSlot, StorageBackend};
use crate::entry::SignedEntry;
use haven_model::types::Hash;
use ::redb::{Database, ReadableTable, TableDefinition};
use prost::Message;
use std::path::Path;

const ENTRIES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entries");
const HEADS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("heads");
const INDEX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("index");

/// redb-backed store storage.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open or create the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ENTRIES_TABLE)?;
            let _ = write_txn.open_table(HEADS_TABLE)?;
            let _ = write_txn.open_table(INDEX_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }
}

impl StorageBackend for RedbBackend {
    fn append_entry(&self, id: &Hash, entry: &SignedEntry) -> Result<(), BackendError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENTRIES_TABLE)?;
            if table.get(id.as_ref())?.is_none() {
                let bytes = entry.encode_to_vec();
                table.insert(id.as_ref(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_entry(&self, id: &Hash) -> Result<Option<SignedEntry>, BackendError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;
        match table.get(id.as_ref())? {
            Some(value) => Ok(Some(SignedEntry::decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn has_entry(&self, id: &Hash) -> Result<bool, BackendError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;
        Ok(table.get(id.as_ref())?.is_some())
    }

    fn entry_ids(&self) -> Result<Vec<Hash>, BackendError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;
        let mut ids = Vec::new();
        for result in table.iter()? {
            let (key, _) = result?;
            let id = Hash::try_from(key.value())
                .map_err(|_| BackendError::Corrupt("bad entry id length".into()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn heads(&self) -> Result<Vec<Hash>, BackendError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HEADS_TABLE)?;
        let mut heads = Vec::new();
        for result in table.iter()? {
            let (key, _) = result?;
            let id = Hash::try_from(key.value())
                .map_err(|_| BackendError::Corrupt("bad head id length".into()))?;
            heads.push(id);
        }
        Ok(heads)
    }

    fn set_heads(&self, heads: &[Hash]) -> Result<(), BackendError> {
        let write_txn = self.db.begin_write()?;
        {
            write_txn.delete_table(HEADS_TABLE)?;
            let mut table = write_txn.open_table(HEADS_TABLE)?;
            for head in heads {
                table.insert(head.as_ref(), b"".as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn index_get(&self, key: &str) -> Result<Option<IndexSlot>, BackendError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(INDEX_TABLE)?;
        match table.get(key)? {
            Some(value) => {
                let slot = IndexSlot::decode(value.value())
                    .map_err(|e| BackendError::Corrupt(e.to_string()))?;
                Ok(Some(slot))
            }
            None => Ok(None),
        }
    }

    fn index_put(&self, key: &str, slot: &IndexSlot) -> Result<(), BackendError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(INDEX_TABLE)?;
            let bytes = slot.encode_to_vec();
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn index_delete(&self, key: &str) -> Result<(), BackendError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(INDEX_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn index_all(&self) -> Result<Vec<(String, IndexSlot)>, BackendError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(INDEX_TABLE)?;
        let mut all = Vec::new();
        for result in table.iter()? {
            let (key, value) = result?;
            let slot = IndexSlot::decode(value.value())
                .map_err(|e| BackendError::Corrupt(e.to_string()))?;
            all.push((key.value().to_string(), slot));
        }
        Ok(all)
    }

    fn index_clear(&self) -> Result<(), BackendError> {
        let write_txn = self.db.begin_write()?;
        {
            write_txn.delete_table(INDEX_TABLE)?;
            let _ = write_txn.open_table(INDEX_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use haven_model::DeviceIdentity;

    #[test]
    fn entry_log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RedbBackend::open(dir.path().join("store.db")).unwrap();

        let identity = DeviceIdentity::generate();
        let signed = Entry::build("k", b"v".to_vec(), vec![], 0).sign(&identity);
        let id = signed.entry_id();

        assert!(!backend.has_entry(&id).unwrap());
        backend.append_entry(&id, &signed).unwrap();
        assert!(backend.has_entry(&id).unwrap());
        assert_eq!(backend.get_entry(&id).unwrap().unwrap(), signed);
        assert_eq!(backend.entry_ids().unwrap(), vec![id]);

        // Re-appending is a no-op.
        backend.append_entry(&id, &signed).unwrap();
        assert_eq!(backend.entry_ids().unwrap().len(), 1);
    }

    #[test]
    fn heads_replace_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RedbBackend::open(dir.path().join("store.db")).unwrap();

        let a = Hash::new([1; 32]);
        let b = Hash::new([2; 32]);
        backend.set_heads(&[a, b]).unwrap();
        assert_eq!(backend.heads().unwrap().len(), 2);

        backend.set_heads(&[b]).unwrap();
        assert_eq!(backend.heads().unwrap(), vec![b]);
    }

    #[test]
    fn index_operations() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RedbBackend::open(dir.path().join("store.db")).unwrap();

        let slot = IndexSlot {
            depth: 3,
            entry_id: vec![7; 32],
            value: b"v".to_vec(),
        };
        backend.index_put("alpha", &slot).unwrap();
        assert_eq!(backend.index_get("alpha").unwrap(), Some(slot.clone()));
        assert_eq!(backend.index_all().unwrap(), vec![("alpha".into(), slot)]);

        backend.index_delete("alpha").unwrap();
        assert_eq!(backend.index_get("alpha").unwrap(), None);
    }
}

//! In-memory storage backend
//!
//! Same contract as the redb backend, held in maps behind an RwLock.
//! Used by tests and by ephemeral stores that never touch disk.

use crate::backend::{BackendError, IndexSlot, StorageBackend};
use crate::entry::SignedEntry;
use haven_model::types::Hash;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Inner {
    entries: BTreeMap<Hash, SignedEntry>,
    heads: Vec<Hash>,
    index: BTreeMap<String, IndexSlot>,
}

/// Ephemeral store storage.
#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, BackendError> {
        self.inner.read().map_err(|_| BackendError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, BackendError> {
        self.inner.write().map_err(|_| BackendError::LockPoisoned)
    }
}

impl StorageBackend for MemoryBackend {
    fn append_entry(&self, id: &Hash, entry: &SignedEntry) -> Result<(), BackendError> {
        self.write()?
            .entries
            .entry(*id)
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    fn get_entry(&self, id: &Hash) -> Result<Option<SignedEntry>, BackendError> {
        Ok(self.read()?.entries.get(id).cloned())
    }

    fn has_entry(&self, id: &Hash) -> Result<bool, BackendError> {
        Ok(self.read()?.entries.contains_key(id))
    }

    fn entry_ids(&self) -> Result<Vec<Hash>, BackendError> {
        Ok(self.read()?.entries.keys().copied().collect())
    }

    fn heads(&self) -> Result<Vec<Hash>, BackendError> {
        Ok(self.read()?.heads.clone())
    }

    fn set_heads(&self, heads: &[Hash]) -> Result<(), BackendError> {
        self.write()?.heads = heads.to_vec();
        Ok(())
    }

    fn index_get(&self, key: &str) -> Result<Option<IndexSlot>, BackendError> {
        Ok(self.read()?.index.get(key).cloned())
    }

    fn index_put(&self, key: &str, slot: &IndexSlot) -> Result<(), BackendError> {
        self.write()?.index.insert(key.to_string(), slot.clone());
        Ok(())
    }

    fn index_delete(&self, key: &str) -> Result<(), BackendError> {
        self.write()?.index.remove(key);
        Ok(())
    }

    fn index_all(&self) -> Result<Vec<(String, IndexSlot)>, BackendError> {
        Ok(self
            .read()?
            .index
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn index_clear(&self) -> Result<(), BackendError> {
        self.write()?.index.clear();
        Ok(())
    }
}

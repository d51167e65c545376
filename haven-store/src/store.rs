//! Replicated key-value store over a signed entry log
//!
//! The raw log is an append-only DAG of signed entries; the materialized
//! view maps each key to the value of its winning valid entry. The
//! winner is a pure function of the entry set: greatest causal depth,
//! ties broken by entry id, so replicas holding the same entries agree
//! regardless of delivery order.
//!
//! A single writer (guarded by `apply_lock`) appends local entries and
//! merges remote ones; readers hit the persisted index without locking.

use crate::backend::{IndexSlot, StorageBackend};
use crate::entry::{Entry, SignedEntry};
use crate::validate::{admit, EntryValidator};
use haven_model::types::Hash;
use haven_model::DeviceIdentity;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    #[error("lock poisoned")]
    LockPoisoned,
}

/// Store notifications, each carrying the snapshot of affected keys.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    /// A local `put` reached the materialized view.
    Write { key: String, value: Vec<u8> },

    /// Initial load finished; the full view snapshot.
    Ready { snapshot: Vec<(String, Vec<u8>)> },

    /// Remote entries were merged; current values of the changed keys.
    Replicated { affected: Vec<(String, Vec<u8>)> },
}

/// A validated replicated key-value store.
pub struct ReplicatedKvStore {
    backend: Arc<dyn StorageBackend>,
    validator: Arc<dyn EntryValidator>,
    identity: DeviceIdentity,
    events_tx: broadcast::Sender<StoreEvent>,
    apply_lock: Mutex<()>,
}

struct Applied {
    /// Entry was not already in the raw log.
    new: bool,
    /// Entry changed the materialized view.
    view_changed: bool,
}

impl ReplicatedKvStore {
    /// Create a store with all collaborators supplied up front.
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        validator: Arc<dyn EntryValidator>,
        identity: DeviceIdentity,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            backend,
            validator,
            identity,
            events_tx,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events_tx.subscribe()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.apply_lock.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Rebuild the materialized view from the raw log and emit `Ready`.
    ///
    /// Replaying from the log makes the view a pure function of the
    /// stored entry set, which also recovers from a crash between an
    /// append and its index update.
    pub fn load(&self) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        self.backend.index_clear()?;
        for id in self.backend.entry_ids()? {
            let Some(entry) = self.backend.get_entry(&id)? else {
                continue;
            };
            self.merge_into_view(&id, &entry)?;
        }
        let snapshot = self.snapshot()?;
        let _ = self.events_tx.send(StoreEvent::Ready { snapshot });
        Ok(())
    }

    /// Write a key locally: sign, append on top of the current heads,
    /// and admit to the view if the entry passes the validation gate.
    ///
    /// A rejected value is kept in the raw log but never surfaces via
    /// `get`; the call still returns `Ok`.
    pub fn put(&self, key: impl Into<String>, value: Vec<u8>) -> Result<(), StoreError> {
        let _guard = self.lock()?;

        let heads = self.backend.heads()?;
        let mut parent_depth = 0;
        for head in &heads {
            if let Some(parent) = self.backend.get_entry(head)? {
                parent_depth = parent_depth.max(parent.entry.depth);
            }
        }

        let signed = Entry::build(key, value, heads, parent_depth).sign(&self.identity);
        let applied = self.apply(&signed)?;
        if applied.view_changed {
            let _ = self.events_tx.send(StoreEvent::Write {
                key: signed.entry.key.clone(),
                value: signed.entry.value.clone(),
            });
        }
        Ok(())
    }

    /// Merge entries received from a peer. Unknown entries are appended
    /// to the raw log whether or not they pass the gate; only admitted
    /// ones can change the view. Returns the number of new entries.
    pub fn ingest(&self, entries: Vec<SignedEntry>) -> Result<usize, StoreError> {
        let _guard = self.lock()?;

        let mut new_count = 0;
        let mut changed_keys = Vec::new();
        for signed in entries {
            let applied = self.apply(&signed)?;
            if applied.new {
                new_count += 1;
            }
            if applied.view_changed && !changed_keys.contains(&signed.entry.key) {
                changed_keys.push(signed.entry.key.clone());
            }
        }

        if new_count > 0 {
            let mut affected = Vec::with_capacity(changed_keys.len());
            for key in changed_keys {
                if let Some(slot) = self.backend.index_get(&key)? {
                    affected.push((key, slot.value));
                }
            }
            let _ = self.events_tx.send(StoreEvent::Replicated { affected });
        }
        Ok(new_count)
    }

    /// Read a key from the materialized view.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.backend.index_get(key)?.map(|slot| slot.value))
    }

    /// Full view snapshot, sorted by key.
    pub fn snapshot(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .backend
            .index_all()?
            .into_iter()
            .map(|(k, slot)| (k, slot.value))
            .collect())
    }

    /// Export the raw log for replication, rejected entries included.
    pub fn entries(&self) -> Result<Vec<SignedEntry>, StoreError> {
        let mut out = Vec::new();
        for id in self.backend.entry_ids()? {
            if let Some(entry) = self.backend.get_entry(&id)? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Append one entry to the log, advance the head set, and merge it
    /// into the view. Caller holds `apply_lock`.
    fn apply(&self, signed: &SignedEntry) -> Result<Applied, StoreError> {
        let id = signed.entry_id();
        if self.backend.has_entry(&id)? {
            return Ok(Applied {
                new: false,
                view_changed: false,
            });
        }

        self.backend.append_entry(&id, signed)?;

        let mut heads = self.backend.heads()?;
        heads.retain(|h| !signed.entry.parent_ids.contains(h));
        heads.push(id);
        self.backend.set_heads(&heads)?;

        let view_changed = self.merge_into_view(&id, signed)?;
        Ok(Applied {
            new: true,
            view_changed,
        })
    }

    /// Gate the entry and, if admitted, race it against the key's
    /// current winner. Returns whether the view changed.
    fn merge_into_view(&self, id: &Hash, signed: &SignedEntry) -> Result<bool, StoreError> {
        if !admit(signed, self.validator.as_ref()) {
            return Ok(false);
        }

        let candidate = IndexSlot {
            depth: signed.entry.depth,
            entry_id: id.to_vec(),
            value: signed.entry.value.clone(),
        };
        let wins = match self.backend.index_get(&signed.entry.key)? {
            Some(current) => candidate.beats(&current),
            None => true,
        };
        if wins {
            self.backend.index_put(&signed.entry.key, &candidate)?;
        }
        Ok(wins)
    }
}

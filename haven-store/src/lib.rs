//! Haven Store
//!
//! An append-only, per-entry-signed replicated log with key-value read
//! semantics. Storage and payload policy are pluggable; the materialized
//! view is a deterministic merge of the validated entry set in causal
//! order, so independent replicas converge on the same view.

pub mod backend;
pub mod entry;
pub mod memory;
pub mod profiles;
pub mod redb;
pub mod store;
pub mod validate;

// Re-exports
pub use crate::backend::{BackendError, IndexSlot, StorageBackend};
pub use crate::entry::{content_hash, Entry, EntryError, SignedEntry};
pub use crate::memory::MemoryBackend;
pub use crate::profiles::{ProfileValidator, UserProfile};
pub use crate::redb::RedbBackend;
pub use crate::store::{ReplicatedKvStore, StoreError, StoreEvent};
pub use crate::validate::{AcceptAll, EntryValidator};

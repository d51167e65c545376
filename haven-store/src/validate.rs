//! Entry validation gate
//!
//! Every entry, locally written or replicated, passes through the gate
//! before it can influence the materialized view:
//!
//! 1. cryptographic — content hash matches the value and the signature
//!    verifies under the author key (`SignedEntry::verify`);
//! 2. payload policy — the store's [`EntryValidator`] strategy, which
//!    also covers structural checks like self-describing keys.
//!
//! Rejected entries stay in the raw log so they remain replicable for
//! audit; they are only excluded from the view. Rejection never raises.

use crate::entry::SignedEntry;

/// Per-store payload policy. One operation, implemented per dataset.
pub trait EntryValidator: Send + Sync + 'static {
    fn validate_entry(&self, entry: &SignedEntry) -> bool;
}

/// Policy that admits every well-signed entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl EntryValidator for AcceptAll {
    fn validate_entry(&self, _entry: &SignedEntry) -> bool {
        true
    }
}

/// Run the full gate. Logs rejections at debug level; never errors.
pub fn admit(entry: &SignedEntry, validator: &dyn EntryValidator) -> bool {
    if let Err(err) = entry.verify() {
        tracing::debug!(key = %entry.entry.key, %err, "rejecting entry: bad signature");
        return false;
    }
    if !validator.validate_entry(entry) {
        tracing::debug!(key = %entry.entry.key, "rejecting entry: payload policy");
        return false;
    }
    true
}

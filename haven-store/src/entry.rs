//! Log entries with strong typing
//!
//! An entry binds a key to a canonically encoded value, links to its
//! causal parents, and carries the author's signature over the value's
//! content hash. Two hashes matter:
//!
//! - `content_hash` — BLAKE3 of the encoded value; the signature is made
//!   and verified over this.
//! - `entry_id` — BLAKE3 of the full signed wire entry; identifies the
//!   DAG node, so equal values written by different authors stay distinct.

use haven_model::types::{Hash, PubKey, Signature as Sig};
use haven_model::{DeviceIdentity, IdentityError};
use prost::Message;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EntryError {
    #[error("proto decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid signature length: expected 64 bytes, got {0}")]
    InvalidSignatureLength(usize),

    #[error("invalid author key length: expected 32 bytes, got {0}")]
    InvalidAuthorLength(usize),

    #[error("invalid hash length in entry")]
    InvalidHashLength,

    #[error("signature verification failed: {0}")]
    Signature(#[from] IdentityError),

    #[error("content hash does not match value")]
    ContentHashMismatch,
}

/// Wire form of an entry's signed portion.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireEntry {
    #[prost(uint32, tag = "1")]
    pub version: u32,

    #[prost(string, tag = "2")]
    pub key: String,

    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,

    /// Entry ids of the DAG heads this entry supersedes.
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub parent_ids: Vec<Vec<u8>>,

    /// Causal depth: max(parent depths) + 1, 1 for roots.
    #[prost(uint64, tag = "5")]
    pub depth: u64,

    /// BLAKE3 of `value`.
    #[prost(bytes = "vec", tag = "6")]
    pub content_hash: Vec<u8>,
}

/// Wire form of a complete signed entry.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireSignedEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub entry_bytes: Vec<u8>,

    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,

    #[prost(bytes = "vec", tag = "3")]
    pub author_id: Vec<u8>,
}

/// A decoded, strongly typed entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub version: u32,
    pub key: String,
    pub value: Vec<u8>,
    pub parent_ids: Vec<Hash>,
    pub depth: u64,
    pub content_hash: Hash,
}

/// An entry plus its cryptographic proof.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedEntry {
    pub entry: Entry,
    pub signature: Sig,
    pub author: PubKey,
}

/// BLAKE3 content hash of an encoded value.
pub fn content_hash(value: &[u8]) -> Hash {
    Hash::new(*blake3::hash(value).as_bytes())
}

impl Entry {
    /// Build an entry for `key`/`value` on top of the given DAG heads.
    /// `parent_depth` is the greatest depth among the parents (0 if none).
    pub fn build(
        key: impl Into<String>,
        value: Vec<u8>,
        parent_ids: Vec<Hash>,
        parent_depth: u64,
    ) -> Self {
        let content_hash = content_hash(&value);
        Self {
            version: 1,
            key: key.into(),
            value,
            parent_ids,
            depth: parent_depth + 1,
            content_hash,
        }
    }

    /// Sign the content hash to produce a complete entry.
    pub fn sign(self, identity: &DeviceIdentity) -> SignedEntry {
        let signature = identity.sign(self.content_hash.as_bytes());
        SignedEntry {
            entry: self,
            signature,
            author: identity.public_key(),
        }
    }

    fn to_wire(&self) -> WireEntry {
        WireEntry {
            version: self.version,
            key: self.key.clone(),
            value: self.value.clone(),
            parent_ids: self.parent_ids.iter().map(|h| h.to_vec()).collect(),
            depth: self.depth,
            content_hash: self.content_hash.to_vec(),
        }
    }
}

impl TryFrom<WireEntry> for Entry {
    type Error = EntryError;

    fn try_from(wire: WireEntry) -> Result<Self, EntryError> {
        let mut parent_ids = Vec::with_capacity(wire.parent_ids.len());
        for raw in wire.parent_ids {
            parent_ids.push(Hash::try_from(raw).map_err(|_| EntryError::InvalidHashLength)?);
        }
        let content_hash =
            Hash::try_from(wire.content_hash).map_err(|_| EntryError::InvalidHashLength)?;
        Ok(Entry {
            version: wire.version,
            key: wire.key,
            value: wire.value,
            parent_ids,
            depth: wire.depth,
            content_hash,
        })
    }
}

impl SignedEntry {
    /// The entry's DAG identity: BLAKE3 of the signed wire encoding.
    pub fn entry_id(&self) -> Hash {
        let bytes = self.to_wire().encode_to_vec();
        Hash::new(*blake3::hash(&bytes).as_bytes())
    }

    /// Cryptographic check: the stored content hash must match the value
    /// and the signature must verify against it under the author key.
    pub fn verify(&self) -> Result<(), EntryError> {
        if content_hash(&self.entry.value) != self.entry.content_hash {
            return Err(EntryError::ContentHashMismatch);
        }
        DeviceIdentity::verify_with_key(
            &self.author,
            self.entry.content_hash.as_bytes(),
            &self.signature,
        )?;
        Ok(())
    }

    pub fn to_wire(&self) -> WireSignedEntry {
        WireSignedEntry {
            entry_bytes: self.entry.to_wire().encode_to_vec(),
            signature: self.signature.to_vec(),
            author_id: self.author.to_vec(),
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        self.to_wire().encode_to_vec()
    }

    /// Decode without verifying; callers gate on `verify` separately so
    /// that invalid entries can still be kept in the raw log.
    pub fn decode(bytes: &[u8]) -> Result<Self, EntryError> {
        let wire = WireSignedEntry::decode(bytes)?;
        Self::try_from(wire)
    }
}

impl TryFrom<WireSignedEntry> for SignedEntry {
    type Error = EntryError;

    fn try_from(wire: WireSignedEntry) -> Result<Self, EntryError> {
        let sig_len = wire.signature.len();
        let signature =
            Sig::try_from(wire.signature).map_err(|_| EntryError::InvalidSignatureLength(sig_len))?;
        let author_len = wire.author_id.len();
        let author =
            PubKey::try_from(wire.author_id).map_err(|_| EntryError::InvalidAuthorLength(author_len))?;
        let entry = Entry::try_from(WireEntry::decode(&wire.entry_bytes[..])?)?;
        Ok(SignedEntry {
            entry,
            signature,
            author,
        })
    }
}

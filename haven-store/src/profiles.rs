//! User profile dataset
//!
//! The concrete store kind shipped with the backend: a profile per user,
//! keyed by the author's public key. The payload policy requires the
//! entry key to equal the profile's key field, the profile to carry a
//! valid inner signature over its content, and the photo to be a small
//! PNG, JPEG or GIF.

use crate::entry::SignedEntry;
use crate::validate::EntryValidator;
use haven_model::types::{PubKey, Signature as Sig};
use haven_model::DeviceIdentity;
use prost::Message;

/// Photo size ceiling: 200 KiB.
pub const MAX_PHOTO_BYTES: usize = 200 * 1024;

/// The signed portion of a profile.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProfileContent {
    /// Hex-encoded public key of the profile owner; also the entry key.
    #[prost(string, tag = "1")]
    pub pub_key: String,

    #[prost(string, tag = "2")]
    pub name: String,

    /// Raw image bytes (PNG, JPEG or GIF).
    #[prost(bytes = "vec", tag = "3")]
    pub photo: Vec<u8>,
}

/// A complete user profile as stored in the log.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UserProfile {
    #[prost(message, optional, tag = "1")]
    pub content: Option<ProfileContent>,

    /// Ed25519 signature by `content.pub_key` over the encoded content.
    #[prost(bytes = "vec", tag = "2")]
    pub sig: Vec<u8>,
}

impl UserProfile {
    /// Build and sign a profile with the owner's identity.
    pub fn create(identity: &DeviceIdentity, name: impl Into<String>, photo: Vec<u8>) -> Self {
        let content = ProfileContent {
            pub_key: identity.public_key().to_hex(),
            name: name.into(),
            photo,
        };
        let sig = identity.sign(&content.encode_to_vec());
        Self {
            content: Some(content),
            sig: sig.to_vec(),
        }
    }
}

fn has_header(bytes: &[u8], header: &[u8]) -> bool {
    bytes.len() >= header.len() && &bytes[..header.len()] == header
}

/// PNG magic byte check.
pub fn is_png(bytes: &[u8]) -> bool {
    has_header(bytes, &[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a])
}

/// JPEG magic byte check.
pub fn is_jpeg(bytes: &[u8]) -> bool {
    has_header(bytes, &[0xff, 0xd8, 0xff])
}

/// GIF magic byte check (GIF89a or GIF87a).
pub fn is_gif(bytes: &[u8]) -> bool {
    has_header(bytes, b"GIF89a") || has_header(bytes, b"GIF87a")
}

/// Payload policy for the profile store.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileValidator;

impl ProfileValidator {
    fn check(entry: &SignedEntry) -> bool {
        let Ok(profile) = UserProfile::decode(&entry.entry.value[..]) else {
            tracing::debug!(key = %entry.entry.key, "profile rejected: undecodable value");
            return false;
        };
        let Some(content) = profile.content else {
            tracing::debug!(key = %entry.entry.key, "profile rejected: missing content");
            return false;
        };

        // Self-describing key: entry key == profile owner == entry author.
        if entry.entry.key != content.pub_key {
            tracing::debug!(key = %entry.entry.key, "profile rejected: key/owner mismatch");
            return false;
        }
        if entry.author.to_hex() != content.pub_key {
            tracing::debug!(key = %entry.entry.key, "profile rejected: author/owner mismatch");
            return false;
        }

        // Inner signature over the encoded content.
        let Ok(owner) = PubKey::from_hex(&content.pub_key) else {
            return false;
        };
        let Ok(sig) = Sig::try_from(profile.sig) else {
            tracing::debug!(key = %entry.entry.key, "profile rejected: malformed signature");
            return false;
        };
        if DeviceIdentity::verify_with_key(&owner, &content.encode_to_vec(), &sig).is_err() {
            tracing::debug!(key = %entry.entry.key, "profile rejected: invalid signature");
            return false;
        }

        // Photo must be a supported format within the size ceiling.
        // An empty photo is allowed (profile without a picture).
        if !content.photo.is_empty() {
            if !is_png(&content.photo) && !is_jpeg(&content.photo) && !is_gif(&content.photo) {
                tracing::debug!(key = %entry.entry.key, "profile rejected: unsupported photo format");
                return false;
            }
            if content.photo.len() > MAX_PHOTO_BYTES {
                tracing::debug!(key = %entry.entry.key, "profile rejected: photo too large");
                return false;
            }
        }

        true
    }
}

impl EntryValidator for ProfileValidator {
    fn validate_entry(&self, entry: &SignedEntry) -> bool {
        Self::check(entry)
    }
}

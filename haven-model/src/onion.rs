//! Onion service addresses
//!
//! A v3 onion address encodes an Ed25519 public key plus a checksum and
//! version byte as 56 characters of lowercase base32. The address is
//! fully derived from the service key, so re-provisioning a service with
//! the same key always yields the same address.

use crate::types::PubKey;
use data_encoding::BASE32_NOPAD;
use sha3::{Digest, Sha3_256};
use thiserror::Error;

/// Canonical textual length of a v3 onion address (without `.onion`).
pub const ONION_ADDRESS_LEN: usize = 56;

const ONION_VERSION: u8 = 3;
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OnionError {
    #[error("invalid onion address length: expected {ONION_ADDRESS_LEN} characters, got {0}")]
    BadLength(usize),

    #[error("onion address is not valid base32")]
    BadEncoding,

    #[error("onion address checksum mismatch")]
    BadChecksum,

    #[error("unsupported onion address version: {0}")]
    BadVersion(u8),
}

/// A validated v3 onion address (service id, without the `.onion` suffix).
#[derive(Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OnionAddress(String);

impl OnionAddress {
    /// Parse and validate a service id.
    pub fn parse(s: &str) -> Result<Self, OnionError> {
        if s.len() != ONION_ADDRESS_LEN {
            return Err(OnionError::BadLength(s.len()));
        }
        let upper = s.to_ascii_uppercase();
        let bytes = BASE32_NOPAD
            .decode(upper.as_bytes())
            .map_err(|_| OnionError::BadEncoding)?;
        // 32-byte key, 2-byte checksum, 1-byte version.
        let (key, rest) = bytes.split_at(32);
        let (checksum, version) = rest.split_at(2);
        if version[0] != ONION_VERSION {
            return Err(OnionError::BadVersion(version[0]));
        }
        if checksum != Self::checksum(key) {
            return Err(OnionError::BadChecksum);
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Derive the address for a service public key.
    pub fn from_public_key(key: &PubKey) -> Self {
        let mut raw = Vec::with_capacity(35);
        raw.extend_from_slice(key.as_bytes());
        raw.extend_from_slice(&Self::checksum(key.as_bytes()));
        raw.push(ONION_VERSION);
        Self(BASE32_NOPAD.encode(&raw).to_ascii_lowercase())
    }

    /// The service public key embedded in this address.
    pub fn public_key(&self) -> PubKey {
        // Validated at construction, so the decode cannot fail.
        let bytes = BASE32_NOPAD
            .decode(self.0.to_ascii_uppercase().as_bytes())
            .unwrap_or_default();
        PubKey::try_from(&bytes[..32]).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn checksum(key: &[u8]) -> [u8; 2] {
        let mut hasher = Sha3_256::new();
        hasher.update(CHECKSUM_PREFIX);
        hasher.update(key);
        hasher.update([ONION_VERSION]);
        let digest = hasher.finalize();
        [digest[0], digest[1]]
    }
}

impl std::fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for OnionAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OnionAddress({})", self.0)
    }
}

impl std::str::FromStr for OnionAddress {
    type Err = OnionError;

    fn from_str(s: &str) -> Result<Self, OnionError> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OnionAddress {
    type Error = OnionError;

    fn try_from(s: String) -> Result<Self, OnionError> {
        Self::parse(&s)
    }
}

impl From<OnionAddress> for String {
    fn from(addr: OnionAddress) -> String {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_address_has_canonical_shape() {
        let key = PubKey::new([7u8; 32]);
        let addr = OnionAddress::from_public_key(&key);
        assert_eq!(addr.as_str().len(), ONION_ADDRESS_LEN);
        assert!(addr
            .as_str()
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '2'..='7')));
    }

    #[test]
    fn derivation_is_deterministic() {
        let key = PubKey::new([42u8; 32]);
        assert_eq!(
            OnionAddress::from_public_key(&key),
            OnionAddress::from_public_key(&key)
        );
    }

    #[test]
    fn parse_round_trips_derived_address() {
        let key = PubKey::new([9u8; 32]);
        let addr = OnionAddress::from_public_key(&key);
        let parsed = OnionAddress::parse(addr.as_str()).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.public_key(), key);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert_eq!(
            OnionAddress::parse("tooshort"),
            Err(OnionError::BadLength(8))
        );
    }

    #[test]
    fn parse_rejects_corrupted_checksum() {
        let addr = OnionAddress::from_public_key(&PubKey::new([1u8; 32]));
        let mut s: Vec<char> = addr.as_str().chars().collect();
        // Flip a character inside the checksum region.
        s[53] = if s[53] == 'a' { 'b' } else { 'a' };
        let corrupted: String = s.into_iter().collect();
        assert!(OnionAddress::parse(&corrupted).is_err());
    }
}

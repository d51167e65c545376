//! Pre-shared network key
//!
//! Communities can restrict overlay membership with a 32-byte pre-shared
//! key. Peers prove possession during the membership handshake; the key
//! itself is persisted base64-encoded in the local database.

use base64::Engine;
use rand::RngCore;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PskError {
    #[error("pre-shared key is not valid base64")]
    BadEncoding,

    #[error("invalid pre-shared key length: expected 32 bytes, got {0}")]
    BadLength(usize),
}

/// A 32-byte pre-shared network key.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkKey([u8; 32]);

impl NetworkKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, PskError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|_| PskError::BadEncoding)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| PskError::BadLength(v.len()))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.write_str("NetworkKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip() {
        let key = NetworkKey::generate();
        let encoded = key.to_base64();
        assert_eq!(NetworkKey::from_base64(&encoded).unwrap(), key);
    }

    #[test]
    fn from_base64_rejects_wrong_length() {
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        assert_eq!(
            NetworkKey::from_base64(&short),
            Err(PskError::BadLength(16))
        );
    }

    #[test]
    fn debug_hides_key_material() {
        assert_eq!(format!("{:?}", NetworkKey::generate()), "NetworkKey(..)");
    }
}

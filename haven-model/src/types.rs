//! Fixed-size byte newtypes
//!
//! Raw `[u8; N]` arrays carry no meaning at call sites; these wrappers
//! give hashes, public keys and signatures distinct types with hex
//! formatting and fallible conversions from untrusted input.

use std::fmt;

macro_rules! byte_array_type {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
        #[repr(transparent)]
        pub struct $name(#[serde(with = "serde_bytes")] [u8; $len]);

        impl $name {
            /// Byte length of this type.
            pub const LEN: usize = $len;

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_vec(&self) -> Vec<u8> {
                self.0.to_vec()
            }

            /// Lowercase hex rendering, `2 * LEN` characters.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from lowercase or uppercase hex.
            pub fn from_hex(s: &str) -> Result<Self, ByteParseError> {
                let bytes = hex::decode(s).map_err(|_| ByteParseError::BadHex)?;
                Self::try_from(bytes.as_slice())
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; $len] {
            fn from(v: $name) -> [u8; $len] {
                v.0
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = ByteParseError;

            fn try_from(slice: &[u8]) -> Result<Self, ByteParseError> {
                let arr: [u8; $len] = slice
                    .try_into()
                    .map_err(|_| ByteParseError::BadLength {
                        expected: $len,
                        got: slice.len(),
                    })?;
                Ok(Self(arr))
            }
        }

        impl TryFrom<Vec<u8>> for $name {
            type Error = ByteParseError;

            fn try_from(vec: Vec<u8>) -> Result<Self, ByteParseError> {
                Self::try_from(vec.as_slice())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = [u8; $len];

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Full hex is unwieldy in logs; eight chars identify a value.
                write!(f, "{}({}..)", stringify!($name), &self.to_hex()[..8])
            }
        }
    };
}

/// Error parsing a fixed-size byte value from untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ByteParseError {
    #[error("invalid hex string")]
    BadHex,

    #[error("invalid length: expected {expected} bytes, got {got}")]
    BadLength { expected: usize, got: usize },
}

byte_array_type!(Hash, 32, "32-byte BLAKE3 hash");
byte_array_type!(PubKey, 32, "32-byte Ed25519 public key");
byte_array_type!(Signature, 64, "64-byte Ed25519 signature");

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);
}

impl Default for Hash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Default for PubKey {
    fn default() -> Self {
        Self([0u8; 32])
    }
}

impl std::hash::Hash for Hash {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl std::hash::Hash for PubKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl PartialOrd for Hash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PubKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PubKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

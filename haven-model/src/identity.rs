//! Device identity and cryptographic keys
//!
//! Each device has an Ed25519 keypair. The public key is the device's
//! network identity; the secret key signs log entries and binds the
//! overlay endpoint. Secret material only ever leaves this type through
//! `secret_bytes`, for persistence in the local database.

use crate::types::{PubKey, Signature as Sig};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("signature verification failed")]
    BadSignature,
}

/// A device identity backed by an Ed25519 keypair.
#[derive(Clone)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("public_key", &self.public_key())
            .finish()
    }
}

impl DeviceIdentity {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from persisted secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != 32 {
            return Err(IdentityError::InvalidKeyLength(bytes.len()));
        }
        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(bytes);
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Secret key bytes for persistence. Handle with care.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    pub fn public_key(&self) -> PubKey {
        PubKey::new(self.signing_key.verifying_key().to_bytes())
    }

    /// The underlying signing key, for binding the overlay endpoint.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn sign(&self, message: &[u8]) -> Sig {
        Sig::new(self.signing_key.sign(message).to_bytes())
    }

    /// Verify a signature against an arbitrary public key.
    pub fn verify_with_key(
        public_key: &PubKey,
        message: &[u8],
        signature: &Sig,
    ) -> Result<(), IdentityError> {
        let key = VerifyingKey::from_bytes(public_key.as_bytes())
            .map_err(|_| IdentityError::InvalidPublicKey)?;
        let sig = Signature::from_bytes(signature.as_bytes());
        key.verify(message, &sig)
            .map_err(|_| IdentityError::BadSignature)
    }
}

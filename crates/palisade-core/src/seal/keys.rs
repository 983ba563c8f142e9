//! Signing-key handling for the seal engine.
//!
//! Key material arrives base64-encoded from configuration or the
//! environment and is zeroized when dropped.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{SigningKey, SECRET_KEY_LENGTH};
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors raised while decoding or generating key material.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The base64 encoding is malformed.
    #[error("invalid base64 key encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// The decoded key has an unexpected length.
    #[error("invalid key length: expected 32 or 64 bytes, got {len}")]
    Length {
        /// The decoded length.
        len: usize,
    },
}

/// An Ed25519 keypair used to sign seals.
///
/// Wraps the signing key so the secret half is only reachable through the
/// seal engine.
pub struct SealKeypair {
    signing_key: SigningKey,
}

impl SealKeypair {
    /// Generates a fresh random keypair.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Decodes a keypair from a base64-encoded secret.
    ///
    /// Accepts either the 32-byte secret seed or the 64-byte
    /// secret-plus-public form some tooling exports.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the encoding is malformed or the decoded
    /// length is neither 32 nor 64 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let decoded = Zeroizing::new(STANDARD.decode(encoded.trim())?);

        let signing_key = match decoded.len() {
            SECRET_KEY_LENGTH => {
                let mut seed = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
                seed.copy_from_slice(&decoded);
                SigningKey::from_bytes(&seed)
            },
            len if len == SECRET_KEY_LENGTH * 2 => {
                let mut seed = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
                seed.copy_from_slice(&decoded[..SECRET_KEY_LENGTH]);
                SigningKey::from_bytes(&seed)
            },
            len => return Err(KeyError::Length { len }),
        };

        Ok(Self { signing_key })
    }

    /// Exports the secret seed as base64, for out-of-band provisioning.
    #[must_use]
    pub fn secret_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.signing_key.to_bytes()))
    }

    /// The base64-encoded public key that travels inside issued seals.
    #[must_use]
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Returns the signing key for the seal engine.
    pub(crate) const fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

//! # XChaCha20-Poly1305 With Derived Nonces
//!
//! Authenticated encryption for request and response payloads.
//!
//! ## Nonce management
//!
//! Nonces here are *derived*, never random: `nonce = H24(NS_NONCE, key
//! material, session)`. Both peers compute the same nonce independently,
//! which is what lets a response travel through a public mailbox with no
//! header at all. The price is that each (key, nonce) pair must encrypt at
//! most one plaintext, ever.
//!
//! That rule is enforced by the types rather than by call-site discipline:
//! a [`SealingKey`] is consumed by [`SealingKey::seal`], and the only way
//! to get one is through the derivations in [`super::derive`], each of
//! which is used exactly once per request in the protocol flow. Opening
//! has no such hazard, so [`OpeningKey::open`] borrows.
//!
//! The nonce doubles as the associated data, binding the ciphertext to the
//! session it was derived for.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{KEY_LENGTH, NONCE_LENGTH, TAG_LENGTH};

/// AEAD failures. Deliberately uninformative.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptFailed,

    #[error("ciphertext too short: must be at least {TAG_LENGTH} bytes")]
    CiphertextTooShort,
}

/// Single-use encryption key: a derived key and the nonce derived with it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SealingKey {
    key: [u8; KEY_LENGTH],
    nonce: [u8; NONCE_LENGTH],
}

/// Decryption counterpart of a [`SealingKey`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct OpeningKey {
    key: [u8; KEY_LENGTH],
    nonce: [u8; NONCE_LENGTH],
}

impl SealingKey {
    pub(crate) fn new(key: [u8; KEY_LENGTH], nonce: [u8; NONCE_LENGTH]) -> Self {
        Self { key, nonce }
    }

    /// Encrypt `plaintext`, consuming the key so its nonce is never reused.
    ///
    /// Output is `ciphertext || tag`, `plaintext.len() + 16` bytes.
    pub fn seal(self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        let payload = Payload {
            msg: plaintext,
            aad: &self.nonce[..],
        };
        cipher
            .encrypt(XNonce::from_slice(&self.nonce), payload)
            .map_err(|_| EncryptionError::EncryptFailed)
    }
}

impl OpeningKey {
    pub(crate) fn new(key: [u8; KEY_LENGTH], nonce: [u8; NONCE_LENGTH]) -> Self {
        Self { key, nonce }
    }

    /// Decrypt and authenticate `ciphertext || tag`.
    pub fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if ciphertext.len() < TAG_LENGTH {
            return Err(EncryptionError::CiphertextTooShort);
        }
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        let payload = Payload {
            msg: ciphertext,
            aad: &self.nonce[..],
        };
        cipher
            .decrypt(XNonce::from_slice(&self.nonce), payload)
            .map_err(|_| EncryptionError::DecryptFailed)
    }
}

//! # Key Pairs
//!
//! Ed25519 key pairs for invites and mailbox slots.
//!
//! Almost every key pair in the protocol is *derived*: the invite key pair
//! comes from the invite seed, and the two mailbox key pairs come from
//! hashes of the request token. Only the seeded constructor matters for
//! interoperability; [`KeyPair::generate`] exists for fresh invites.
//!
//! Secret material is never logged. `Debug` prints the public key only.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

use crate::config::{KEY_LENGTH, SIGNATURE_LENGTH};

/// An Ed25519 key pair.
///
/// Does not implement `Serialize`: the only persisted form of a key pair in
/// this crate is the seed it was derived from.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Derive the key pair for a 32-byte seed. Deterministic.
    pub fn from_seed(seed: &[u8; KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// A key pair from a fresh random seed.
    pub fn generate() -> Self {
        Self::from_seed(&random_seed())
    }

    /// The 32-byte public key.
    pub fn public_key(&self) -> [u8; KEY_LENGTH] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair(pub={})", hex::encode(self.public_key()))
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public_key() == other.public_key()
    }
}

impl Eq for KeyPair {}

/// Verify a detached Ed25519 signature.
///
/// Returns `false` for a malformed public key as well as for a bad
/// signature; callers only ever need the yes/no answer.
pub fn verify(
    public_key: &[u8; KEY_LENGTH],
    message: &[u8],
    signature: &[u8; SIGNATURE_LENGTH],
) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let signature = Signature::from_bytes(signature);
    verifying_key.verify(message, &signature).is_ok()
}

/// 32 bytes from the OS RNG.
pub fn random_seed() -> [u8; KEY_LENGTH] {
    let mut seed = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut seed);
    seed
}

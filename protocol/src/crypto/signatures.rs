//! # Namespaced Signatures
//!
//! Signatures in blind pairing never cover raw data. The signed message is
//! `NS_SIGNATURE || data`, so a signature produced here cannot be replayed
//! as a valid signature in any other protocol that uses the same key.
//!
//! The one exception is invite additional data, which the original invite
//! creator signs plainly with [`KeyPair::sign`] and the candidate checks
//! with [`keys::verify`](super::keys::verify).

use super::hash::NS;
use super::keys::{verify, KeyPair};
use crate::config::{KEY_LENGTH, SIGNATURE_LENGTH};

fn namespaced(data: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(NS.signature.len() + data.len());
    message.extend_from_slice(&NS.signature);
    message.extend_from_slice(data);
    message
}

/// Sign `NS_SIGNATURE || data`.
pub fn sign_namespaced(data: &[u8], key_pair: &KeyPair) -> [u8; SIGNATURE_LENGTH] {
    key_pair.sign(&namespaced(data))
}

/// Verify a signature produced by [`sign_namespaced`].
pub fn verify_namespaced(
    data: &[u8],
    signature: &[u8; SIGNATURE_LENGTH],
    public_key: &[u8; KEY_LENGTH],
) -> bool {
    verify(public_key, &namespaced(data), signature)
}

//! # Cryptographic Primitives for Blind Pairing
//!
//! Everything security-related flows through here:
//!
//! - **Ed25519** for invite and mailbox key pairs, with namespaced signatures.
//! - **XChaCha20-Poly1305** for request and response payloads. The 192-bit
//!   nonce is large enough to be derived from a hash instead of a counter.
//! - **BLAKE3** for every identifier, key and nonce derivation.
//!
//! Everything here is a thin wrapper around audited implementations. The
//! only protocol-specific logic is *which* bytes get hashed together, and
//! that lives in [`derive`].

pub mod derive;
pub mod encryption;
pub mod hash;
pub mod keys;
pub mod signatures;

pub use encryption::{EncryptionError, OpeningKey, SealingKey};
pub use hash::{blake3_hash, blake3_hash_multi, discovery_key};
pub use keys::{random_seed, verify, KeyPair};
pub use signatures::{sign_namespaced, verify_namespaced};

//! # Hashing & Namespaces
//!
//! Every identifier in blind pairing is a BLAKE3 digest of a namespace tag
//! followed by public material. Parts are fed to the hasher in order, which
//! is equivalent to hashing their concatenation; callers never allocate a
//! scratch buffer just to hash.
//!
//! ## Namespaces
//!
//! A namespace is a family of 32-byte tags derived from a name:
//!
//! ```text
//! ns      = H(name)
//! tag[i]  = H(ns || i)      (i as a single byte)
//! ```
//!
//! Tags from different families or different indices never collide, so a
//! digest computed for one purpose can never be replayed for another.

use once_cell::sync::Lazy;

use crate::config::{CORE_NAMESPACE, DHT_NAMESPACE, DISCOVERY_KEY_MESSAGE, KEY_LENGTH};

/// The eight handshake tags, in protocol order.
pub struct CoreNamespace {
    pub signature: [u8; 32],
    pub token: [u8; 32],
    pub invite_id: [u8; 32],
    pub request_id: [u8; 32],
    pub session: [u8; 32],
    pub session_key: [u8; 32],
    pub encrypt: [u8; 32],
    pub nonce: [u8; 32],
}

/// The three rendezvous tags, in protocol order.
pub struct DhtNamespace {
    pub ephemeral: [u8; 32],
    pub reply: [u8; 32],
    pub discovery: [u8; 32],
}

/// Handshake tags, computed once per process.
pub static NS: Lazy<CoreNamespace> = Lazy::new(|| {
    let tags = namespace(CORE_NAMESPACE, 8);
    CoreNamespace {
        signature: tags[0],
        token: tags[1],
        invite_id: tags[2],
        request_id: tags[3],
        session: tags[4],
        session_key: tags[5],
        encrypt: tags[6],
        nonce: tags[7],
    }
});

/// Rendezvous tags, computed once per process.
pub static DHT_NS: Lazy<DhtNamespace> = Lazy::new(|| {
    let tags = namespace(DHT_NAMESPACE, 3);
    DhtNamespace {
        ephemeral: tags[0],
        reply: tags[1],
        discovery: tags[2],
    }
});

/// BLAKE3 of a single input.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 of several slices, hashed as if concatenated.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Fill `out` with the BLAKE3 extended output of the concatenated parts.
///
/// Used where the protocol needs a digest that is not 32 bytes long, such
/// as the 24-byte AEAD nonce.
pub fn blake3_hash_into(parts: &[&[u8]], out: &mut [u8]) {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize_xof().fill(out);
}

/// Derive `count` domain tags from a namespace name.
pub fn namespace(name: &str, count: u8) -> Vec<[u8; 32]> {
    let ns = blake3_hash(name.as_bytes());
    (0..count)
        .map(|i| blake3_hash_multi(&[&ns, &[i]]))
        .collect()
}

/// Public topic identifier for a resource key.
///
/// Keyed hash, so knowing the discovery key reveals nothing about the
/// resource key it came from.
pub fn discovery_key(key: &[u8; KEY_LENGTH]) -> [u8; 32] {
    *blake3::keyed_hash(key, DISCOVERY_KEY_MESSAGE).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_matches_concatenation() {
        let multi = blake3_hash_multi(&[b"blind", b"-", b"pairing"]);
        assert_eq!(multi, blake3_hash(b"blind-pairing"));
    }

    #[test]
    fn namespace_tags_are_distinct() {
        let tags = namespace(CORE_NAMESPACE, 8);
        for (i, a) in tags.iter().enumerate() {
            for b in &tags[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn namespaces_do_not_overlap() {
        let core = namespace(CORE_NAMESPACE, 8);
        let dht = namespace(DHT_NAMESPACE, 3);
        assert!(dht.iter().all(|tag| !core.contains(tag)));
    }

    #[test]
    fn static_tags_follow_namespace_order() {
        let tags = namespace(CORE_NAMESPACE, 8);
        assert_eq!(NS.signature, tags[0]);
        assert_eq!(NS.nonce, tags[7]);
        assert_eq!(DHT_NS.discovery, namespace(DHT_NAMESPACE, 3)[2]);
    }

    #[test]
    fn xof_prefix_matches_digest() {
        // The first 32 bytes of the extended output are the regular digest.
        let mut out = [0u8; 48];
        blake3_hash_into(&[b"nonce", b"material"], &mut out);
        assert_eq!(&out[..32], &blake3_hash(b"noncematerial"));
    }

    #[test]
    fn discovery_key_depends_on_key() {
        let a = discovery_key(&[1u8; 32]);
        let b = discovery_key(&[2u8; 32]);
        assert_ne!(a, b);
        assert_eq!(a, discovery_key(&[1u8; 32]));
        assert_ne!(a, [1u8; 32]);
    }
}

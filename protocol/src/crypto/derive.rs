//! # Domain-Separated Derivations
//!
//! Every secret and identifier in the protocol is a pure function of public
//! material and a namespace tag. Recomputing from the same inputs always
//! yields the same bytes, which is what lets the mailbox rendezvous work
//! without a coordination message.
//!
//! ```text
//! invite_id   = H(NS_INVITE_ID, invite_pk)
//! token       = H(NS_TOKEN, invite_pk, user_data)
//! session     = H(NS_SESSION, token)
//! request_id  = H(NS_REQUEST_ID, session)
//! session_key = H(NS_SESSION_KEY, invite_pk, session)
//! enc_key(x)  = H(NS_ENCRYPT, x)
//! nonce(x, s) = H24(NS_NONCE, x, s)
//!
//! ephemeral   = KeyPair(H(NS_EPHEMERAL, token))   candidate request slot
//! reply       = KeyPair(H(NS_REPLY, token))       member reply slot
//! topic       = H(NS_DISCOVERY, discovery_key)    announce/lookup topic
//! ```
//!
//! Requests are sealed under `enc_key(invite_pk)`; responses under
//! `enc_key(session_key)`. The two never share key material.

use super::encryption::{OpeningKey, SealingKey};
use super::hash::{blake3_hash_into, blake3_hash_multi, DHT_NS, NS};
use super::keys::KeyPair;
use crate::config::{KEY_LENGTH, NONCE_LENGTH};

/// Stable public identifier of an invite.
pub fn derive_invite_id(public_key: &[u8; KEY_LENGTH]) -> [u8; 32] {
    blake3_hash_multi(&[&NS.invite_id, public_key])
}

/// Token binding one (invite, user data) pairing attempt.
pub fn derive_token(public_key: &[u8; KEY_LENGTH], user_data: &[u8]) -> [u8; 32] {
    blake3_hash_multi(&[&NS.token, public_key, user_data])
}

/// Session token for a pairing attempt.
pub fn create_session_token(token: &[u8; 32]) -> [u8; 32] {
    blake3_hash_multi(&[&NS.session, token])
}

/// Request id, echoed by the member in its response.
pub fn derive_request_id(session: &[u8]) -> [u8; 32] {
    blake3_hash_multi(&[&NS.request_id, session])
}

/// Per-session key material the response is sealed under.
pub fn derive_session_key(invite_public_key: &[u8; KEY_LENGTH], session: &[u8]) -> [u8; 32] {
    blake3_hash_multi(&[&NS.session_key, invite_public_key, session])
}

fn derive_encryption_key(material: &[u8; KEY_LENGTH]) -> [u8; KEY_LENGTH] {
    blake3_hash_multi(&[&NS.encrypt, material])
}

fn derive_nonce(material: &[u8; KEY_LENGTH], session: &[u8]) -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    blake3_hash_into(&[&NS.nonce, material, session], &mut nonce);
    nonce
}

/// Sealing key for a candidate's request payload.
pub fn request_sealing_key(invite_public_key: &[u8; KEY_LENGTH], session: &[u8]) -> SealingKey {
    SealingKey::new(
        derive_encryption_key(invite_public_key),
        derive_nonce(invite_public_key, session),
    )
}

/// Opening key for a request payload.
pub fn request_opening_key(invite_public_key: &[u8; KEY_LENGTH], session: &[u8]) -> OpeningKey {
    OpeningKey::new(
        derive_encryption_key(invite_public_key),
        derive_nonce(invite_public_key, session),
    )
}

/// Sealing key for a member's response payload.
pub fn reply_sealing_key(invite_public_key: &[u8; KEY_LENGTH], session: &[u8]) -> SealingKey {
    let session_key = derive_session_key(invite_public_key, session);
    SealingKey::new(
        derive_encryption_key(&session_key),
        derive_nonce(&session_key, session),
    )
}

/// Opening key for a response payload.
pub fn reply_opening_key(invite_public_key: &[u8; KEY_LENGTH], session: &[u8]) -> OpeningKey {
    let session_key = derive_session_key(invite_public_key, session);
    OpeningKey::new(
        derive_encryption_key(&session_key),
        derive_nonce(&session_key, session),
    )
}

/// Mailbox slot where a candidate publishes its encoded request.
pub fn derive_ephemeral_key_pair(token: &[u8; 32]) -> KeyPair {
    KeyPair::from_seed(&blake3_hash_multi(&[&DHT_NS.ephemeral, token]))
}

/// Mailbox slot where a member publishes its response.
pub fn derive_reply_key_pair(token: &[u8; 32]) -> KeyPair {
    KeyPair::from_seed(&blake3_hash_multi(&[&DHT_NS.reply, token]))
}

/// Rendezvous topic candidates announce under and members look up.
pub fn derive_pairing_topic(discovery_key: &[u8; 32]) -> [u8; 32] {
    blake3_hash_multi(&[&DHT_NS.discovery, discovery_key])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_chain_is_deterministic() {
        let pk = KeyPair::from_seed(&[1u8; 32]).public_key();
        let token = derive_token(&pk, b"alice");
        assert_eq!(token, derive_token(&pk, b"alice"));
        assert_ne!(token, derive_token(&pk, b"bob"));

        let session = create_session_token(&token);
        assert_eq!(derive_request_id(&session), derive_request_id(&session));
        assert_ne!(session, token);
    }

    #[test]
    fn reply_slot_is_independently_derivable() {
        let pk = KeyPair::from_seed(&[2u8; 32]).public_key();
        let token = derive_token(&pk, b"alice");

        // Candidate and an observer holding the same token land on the
        // same mailbox slot.
        let candidate = derive_reply_key_pair(&token);
        let observer = derive_reply_key_pair(&derive_token(&pk, b"alice"));
        assert_eq!(candidate.public_key(), observer.public_key());
    }

    #[test]
    fn ephemeral_and_reply_slots_differ() {
        let token = [3u8; 32];
        assert_ne!(
            derive_ephemeral_key_pair(&token).public_key(),
            derive_reply_key_pair(&token).public_key()
        );
    }

    #[test]
    fn request_and_reply_keys_do_not_interoperate() {
        let pk = KeyPair::from_seed(&[4u8; 32]).public_key();
        let session = [5u8; 32];

        let sealed = request_sealing_key(&pk, &session).seal(b"payload").unwrap();
        assert_eq!(
            request_opening_key(&pk, &session).open(&sealed).unwrap(),
            b"payload"
        );
        assert!(reply_opening_key(&pk, &session).open(&sealed).is_err());

        let reply = reply_sealing_key(&pk, &session).seal(b"reply").unwrap();
        assert_eq!(reply_opening_key(&pk, &session).open(&reply).unwrap(), b"reply");
        assert!(request_opening_key(&pk, &session).open(&reply).is_err());
    }

    #[test]
    fn pairing_topic_hides_discovery_key() {
        let dk = [6u8; 32];
        assert_ne!(derive_pairing_topic(&dk), dk);
        assert_eq!(derive_pairing_topic(&dk), derive_pairing_topic(&dk));
    }
}

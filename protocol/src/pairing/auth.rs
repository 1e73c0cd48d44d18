//! # Auth Envelope
//!
//! The four sealing operations of the handshake:
//!
//! ```text
//! create_auth   candidate  sign (session, user_data) with the invite key,
//!                          seal {signature, user_data} under enc_key(invite_pk)
//! open_auth     member     open, decode, verify -> InviteReceipt
//! create_reply  member     seal a ResponsePayload under enc_key(session_key)
//! open_reply    candidate  open + decode a ResponsePayload
//! ```
//!
//! Each derived sealing key is used once per request: `create_auth` once
//! when the candidate request is built, `create_reply` once when the member
//! makes its one-shot decision.

use crate::crypto::derive::{
    reply_opening_key, reply_sealing_key, request_opening_key, request_sealing_key,
};
use crate::crypto::{sign_namespaced, verify_namespaced, KeyPair};
use crate::config::KEY_LENGTH;
use crate::error::{PairingError, Result};
use crate::wire::{AuthData, Codec, InviteData, InviteReceipt, RequestPayload, ResponsePayload};

/// Build the encrypted, signed request payload for `session`.
pub fn create_auth(
    user_data: &[u8],
    invite_key_pair: &KeyPair,
    session: &[u8; 32],
) -> Result<RequestPayload> {
    let public_key = invite_key_pair.public_key();
    let sign_data = AuthData { session, user_data }.encode();
    let signature = sign_namespaced(&sign_data, invite_key_pair);

    let invite_data = InviteData {
        signature,
        user_data: user_data.to_vec(),
    }
    .encode();
    let data = request_sealing_key(&public_key, session).seal(&invite_data)?;

    Ok(RequestPayload {
        session: *session,
        data,
    })
}

/// Decrypt and verify a request payload with the invite's public key.
///
/// Fails with [`PairingError::Decryption`] when the key does not match and
/// [`PairingError::InvalidReply`] when the inner signature does not verify.
pub fn open_auth(
    payload: &RequestPayload,
    invite_public_key: &[u8; KEY_LENGTH],
) -> Result<InviteReceipt> {
    let plaintext = request_opening_key(invite_public_key, &payload.session)
        .open(&payload.data)
        .map_err(|_| PairingError::Decryption)?;

    let InviteData {
        signature,
        user_data,
    } = InviteData::decode(&plaintext)?;

    let receipt = InviteReceipt {
        session: payload.session,
        signature,
        user_data,
    };

    if !receipt_is_valid(&receipt, invite_public_key) {
        return Err(PairingError::InvalidReply);
    }
    Ok(receipt)
}

/// Seal a member's response for the candidate that sent `session`.
pub fn create_reply(
    payload: &ResponsePayload,
    session: &[u8; 32],
    invite_public_key: &[u8; KEY_LENGTH],
) -> Result<Vec<u8>> {
    Ok(reply_sealing_key(invite_public_key, session).seal(&payload.encode())?)
}

/// Open a member's response.
pub fn open_reply(
    data: &[u8],
    session: &[u8; 32],
    invite_public_key: &[u8; KEY_LENGTH],
) -> Result<ResponsePayload> {
    let plaintext = reply_opening_key(invite_public_key, session)
        .open(data)
        .map_err(|_| PairingError::Decryption)?;
    Ok(ResponsePayload::decode(&plaintext)?)
}

/// Whether the receipt's signature covers its session and user data.
pub fn receipt_is_valid(receipt: &InviteReceipt, invite_public_key: &[u8; KEY_LENGTH]) -> bool {
    let sign_data = AuthData {
        session: &receipt.session,
        user_data: &receipt.user_data,
    }
    .encode();
    verify_namespaced(&sign_data, &receipt.signature, invite_public_key)
}

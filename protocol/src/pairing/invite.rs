//! # Invites & Receipts
//!
//! An invite is created offline by whoever controls the resource and handed
//! to the candidate out-of-band. The member never sees the seed: it only
//! needs the invite's public key, or the invite id to look it up.

use chrono::Utc;

use crate::crypto::derive::{derive_invite_id, derive_token, create_session_token};
use crate::crypto::{discovery_key, random_seed, KeyPair};
use crate::config::KEY_LENGTH;
use crate::error::Result;
use crate::wire::{AdditionalData, Codec, Invite, InviteReceipt};

use super::auth::{create_auth, open_auth, receipt_is_valid};

/// Options for [`create_invite`]. Everything defaults sensibly.
#[derive(Clone, Debug, Default)]
pub struct InviteOptions {
    /// Rendezvous topic. Defaults to `discovery_key(key)`.
    pub discovery_key: Option<[u8; 32]>,
    /// Unix milliseconds. Anything under one second means no expiry.
    pub expires: Option<u64>,
    /// Defaults to 32 random bytes.
    pub seed: Option<[u8; KEY_LENGTH]>,
    pub sensitive: bool,
    /// Signed with the invite key pair and returned as `additional`.
    pub data: Option<Vec<u8>>,
    pub test_invitation: bool,
}

/// Everything the invite creator needs to keep.
#[derive(Clone, Debug)]
pub struct CreatedInvite {
    pub id: [u8; 32],
    /// Encoded invite, the bytes handed to the candidate.
    pub invite: Vec<u8>,
    pub seed: [u8; KEY_LENGTH],
    pub public_key: [u8; KEY_LENGTH],
    pub additional: Option<AdditionalData>,
    pub discovery_key: [u8; 32],
    pub expires: Option<u64>,
    pub sensitive: bool,
    pub test_invitation: bool,
}

/// A decoded invite with its derived id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedInvite {
    pub id: [u8; 32],
    pub invite: Invite,
}

impl DecodedInvite {
    /// Whether the invite's expiry is in the past at `now_ms`.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        matches!(self.invite.expires, Some(expires) if expires <= now_ms)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }
}

pub(crate) fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Create an invite for the resource `key`.
pub fn create_invite(key: &[u8; 32], opts: InviteOptions) -> CreatedInvite {
    let discovery_key = opts.discovery_key.unwrap_or_else(|| discovery_key(key));
    let expires = opts.expires.filter(|ms| *ms >= 1000);
    let seed = opts.seed.unwrap_or_else(random_seed);
    let key_pair = KeyPair::from_seed(&seed);
    let public_key = key_pair.public_key();

    let additional = opts.data.map(|data| AdditionalData {
        signature: key_pair.sign(&data),
        data,
    });

    let invite = Invite {
        seed,
        discovery_key: Some(discovery_key),
        expires,
        sensitive: opts.sensitive,
        test_invitation: opts.test_invitation,
    };

    CreatedInvite {
        id: derive_invite_id(&public_key),
        invite: invite.encode(),
        seed,
        public_key,
        additional,
        discovery_key,
        expires,
        sensitive: opts.sensitive,
        test_invitation: opts.test_invitation,
    }
}

/// Decode invite bytes and compute the invite id.
pub fn decode_invite(bytes: &[u8]) -> Result<DecodedInvite> {
    let invite = Invite::decode(bytes)?;
    let public_key = KeyPair::from_seed(&invite.seed).public_key();
    Ok(DecodedInvite {
        id: derive_invite_id(&public_key),
        invite,
    })
}

/// A receipt produced without a member.
#[derive(Clone, Debug)]
pub struct CreatedReceipt {
    pub id: [u8; 32],
    pub receipt: Vec<u8>,
}

/// Produce the receipt a member would obtain by opening a request for
/// `user_data` against `invite`.
pub fn create_receipt(invite: &Invite, user_data: &[u8]) -> Result<CreatedReceipt> {
    let key_pair = KeyPair::from_seed(&invite.seed);
    let public_key = key_pair.public_key();
    let session = create_session_token(&derive_token(&public_key, user_data));

    let payload = create_auth(user_data, &key_pair, &session)?;
    let receipt = open_auth(&payload, &public_key)?;

    Ok(CreatedReceipt {
        id: derive_invite_id(&public_key),
        receipt: receipt.encode(),
    })
}

/// Verify an encoded receipt. Returns the user data it vouches for.
pub fn verify_receipt(receipt: &[u8], public_key: &[u8; KEY_LENGTH]) -> Option<Vec<u8>> {
    let receipt = InviteReceipt::decode(receipt).ok()?;
    verify_decoded_receipt(&receipt, public_key)
}

/// Verify an already decoded receipt.
pub fn verify_decoded_receipt(
    receipt: &InviteReceipt,
    public_key: &[u8; KEY_LENGTH],
) -> Option<Vec<u8>> {
    receipt_is_valid(receipt, public_key).then(|| receipt.user_data.clone())
}

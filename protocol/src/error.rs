//! Error types for blind pairing.
//!
//! Every handshake operation that can fail returns a [`PairingError`]. The
//! variants split into three groups with different consequences:
//!
//! - **Per-message**: `Decode`, `Decryption`, `InvalidReply`. The message is
//!   dropped, the session keeps polling.
//! - **Protocol outcomes**: `PairingRejected`, `InviteUsed`, `InviteExpired`,
//!   plus the integrity failures `DiscoveryKeyMismatch` and
//!   `SignatureInvalid`. Surfaced to the candidate as a rejection reason.
//! - **Registry / lifecycle**: `MemberExists`, `CandidateExists`,
//!   `RequestClosed`, `Closed`.

use thiserror::Error;

use crate::crypto::EncryptionError;
use crate::wire::DecodeError;

/// Errors surfaced by the pairing handshake and the registry.
///
/// `Clone` so one outcome can be handed to several observers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    /// Malformed wire bytes or an unknown version.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// AEAD failure: wrong key, wrong session, or tampered ciphertext.
    #[error("could not decrypt payload")]
    Decryption,

    /// Decrypted cleanly but the inner signature does not verify.
    #[error("invalid reply: inner signature does not verify")]
    InvalidReply,

    /// `open` was called with a key that does not match the request.
    #[error("invalid invite key")]
    InvalidInviteKey,

    /// The member explicitly refused the request.
    #[error("pairing rejected")]
    PairingRejected,

    /// The invite was already consumed.
    #[error("invite has already been used")]
    InviteUsed,

    /// The invite's expiry has passed.
    #[error("invite has expired")]
    InviteExpired,

    /// The capability in the response is for a different resource.
    #[error("response key does not match the requested discovery key")]
    DiscoveryKeyMismatch,

    /// Additional data in the response is not signed by the invite key.
    #[error("additional data signature is invalid")]
    SignatureInvalid,

    /// A member is already registered for this discovery key.
    #[error("member already exists for discovery key {0}")]
    MemberExists(String),

    /// A candidate is already registered for this discovery key.
    #[error("candidate already exists for discovery key {0}")]
    CandidateExists(String),

    /// The invite carries no discovery key, so a response cannot be bound
    /// to a resource.
    #[error("invite has no discovery key")]
    MissingDiscoveryKey,

    /// The request was destroyed or already completed.
    #[error("request is closed")]
    RequestClosed,

    /// The registry or session is shutting down.
    #[error("pairing closed")]
    Closed,

    /// A cryptographic primitive failed unexpectedly.
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl PairingError {
    /// Whether this error is a final answer from the member, as opposed to
    /// a message that could not be processed.
    pub fn is_protocol_outcome(&self) -> bool {
        matches!(
            self,
            PairingError::PairingRejected | PairingError::InviteUsed | PairingError::InviteExpired
        )
    }
}

impl From<EncryptionError> for PairingError {
    fn from(e: EncryptionError) -> Self {
        match e {
            EncryptionError::EncryptFailed => PairingError::Crypto(e.to_string()),
            EncryptionError::DecryptFailed | EncryptionError::CiphertextTooShort => {
                PairingError::Decryption
            }
        }
    }
}

/// Convenience alias used throughout the handshake modules.
pub type Result<T> = std::result::Result<T, PairingError>;

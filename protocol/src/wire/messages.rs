//! # Wire Messages
//!
//! Field order and flag bits are fixed; two peers that disagree on either
//! cannot pair.
//!
//! ```text
//! Invite           version=1 | flags | seed[32] | dk[32]? | expires u32 (secs)?
//!                  flags: bit0 dk, bit1 expires, bit2 sensitive, bit3 test
//! RequestPayload   session buf | data buf
//! InviteRequest    invite_id[32] | RequestPayload
//! ResponsePayload  status | (status == 0) flags | key[32] | enc_key[32]? | additional?
//!                  flags: bit0 enc_key, bit1 additional
//! AdditionalData   data buf | signature[64]
//! InviteResponse   id[32] | payload buf
//! InviteData       signature[64] | user_data buf
//! InviteReceipt    session[32] | signature[64] | user_data buf
//! AuthData         session buf | user_data buf
//! PersistedRequest version=1 | flags | seed[32] | dk[32] | user_data buf | key[32]?
//!                  flags: bit0 key
//! ```

use bytes::BufMut;

use super::state::{buffer_len, put_buffer, put_uint, uint_len, Codec, DecodeError, Decoder};
use crate::config::{INVITE_VERSION, KEY_LENGTH, PERSISTED_REQUEST_VERSION, SIGNATURE_LENGTH};

mod flags {
    pub const INVITE_DISCOVERY_KEY: u64 = 1;
    pub const INVITE_EXPIRES: u64 = 2;
    pub const INVITE_SENSITIVE: u64 = 4;
    pub const INVITE_TEST: u64 = 8;

    pub const RESPONSE_ENCRYPTION_KEY: u64 = 1;
    pub const RESPONSE_ADDITIONAL: u64 = 2;

    pub const PERSISTED_KEY: u64 = 1;
}

// ---------------------------------------------------------------------------
// Invite
// ---------------------------------------------------------------------------

/// The offline capability handed to a candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invite {
    pub seed: [u8; KEY_LENGTH],
    pub discovery_key: Option<[u8; 32]>,
    /// Unix milliseconds. Encoded with second precision.
    pub expires: Option<u64>,
    pub sensitive: bool,
    pub test_invitation: bool,
}

impl Invite {
    fn flags(&self) -> u64 {
        let mut f = 0;
        if self.discovery_key.is_some() {
            f |= flags::INVITE_DISCOVERY_KEY;
        }
        if self.expires_secs().is_some() {
            f |= flags::INVITE_EXPIRES;
        }
        if self.sensitive {
            f |= flags::INVITE_SENSITIVE;
        }
        if self.test_invitation {
            f |= flags::INVITE_TEST;
        }
        f
    }

    /// Expiry in whole seconds. Zero means the invite never expires.
    fn expires_secs(&self) -> Option<u32> {
        self.expires
            .map(|ms| u32::try_from(ms / 1000).unwrap_or(u32::MAX))
            .filter(|secs| *secs > 0)
    }
}

impl Codec for Invite {
    fn preencode(&self) -> usize {
        let mut len = uint_len(INVITE_VERSION) + uint_len(self.flags()) + KEY_LENGTH;
        if self.discovery_key.is_some() {
            len += 32;
        }
        if self.expires_secs().is_some() {
            len += 4;
        }
        len
    }

    fn encode_into<B: BufMut>(&self, out: &mut B) {
        put_uint(out, INVITE_VERSION);
        put_uint(out, self.flags());
        out.put_slice(&self.seed);
        if let Some(dk) = &self.discovery_key {
            out.put_slice(dk);
        }
        if let Some(secs) = self.expires_secs() {
            out.put_u32_le(secs);
        }
    }

    fn decode_from(src: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = src.uint()?;
        if version != INVITE_VERSION {
            return Err(DecodeError::UnknownVersion(version));
        }
        let f = src.uint()?;
        let seed = src.fixed()?;
        let discovery_key = if f & flags::INVITE_DISCOVERY_KEY != 0 {
            Some(src.fixed()?)
        } else {
            None
        };
        let expires = if f & flags::INVITE_EXPIRES != 0 {
            Some(u64::from(src.uint32()?) * 1000).filter(|ms| *ms > 0)
        } else {
            None
        };
        Ok(Self {
            seed,
            discovery_key,
            expires,
            sensitive: f & flags::INVITE_SENSITIVE != 0,
            test_invitation: f & flags::INVITE_TEST != 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Encrypted auth envelope carried by a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestPayload {
    pub session: [u8; 32],
    pub data: Vec<u8>,
}

impl Codec for RequestPayload {
    fn preencode(&self) -> usize {
        buffer_len(&self.session) + buffer_len(&self.data)
    }

    fn encode_into<B: BufMut>(&self, out: &mut B) {
        put_buffer(out, &self.session);
        put_buffer(out, &self.data);
    }

    fn decode_from(src: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            session: src.sized_buffer()?,
            data: src.buffer()?,
        })
    }
}

/// Candidate -> member. Channel slot 0 and the candidate's mailbox slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteRequest {
    pub invite_id: [u8; 32],
    pub payload: RequestPayload,
}

impl Codec for InviteRequest {
    fn preencode(&self) -> usize {
        32 + self.payload.preencode()
    }

    fn encode_into<B: BufMut>(&self, out: &mut B) {
        out.put_slice(&self.invite_id);
        self.payload.encode_into(out);
    }

    fn decode_from(src: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            invite_id: src.fixed()?,
            payload: RequestPayload::decode_from(src)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Data signed by the invite key pair at invite creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdditionalData {
    pub data: Vec<u8>,
    pub signature: [u8; SIGNATURE_LENGTH],
}

impl Codec for AdditionalData {
    fn preencode(&self) -> usize {
        buffer_len(&self.data) + SIGNATURE_LENGTH
    }

    fn encode_into<B: BufMut>(&self, out: &mut B) {
        put_buffer(out, &self.data);
        out.put_slice(&self.signature);
    }

    fn decode_from(src: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            data: src.buffer()?,
            signature: src.fixed()?,
        })
    }
}

/// Non-zero response status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Rejected = 1,
    Used = 2,
    Expired = 3,
}

impl ResponseStatus {
    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn from_code(code: u64) -> Result<Self, DecodeError> {
        match code {
            1 => Ok(Self::Rejected),
            2 => Ok(Self::Used),
            3 => Ok(Self::Expired),
            other => Err(DecodeError::UnknownStatus(other)),
        }
    }
}

/// Plaintext of a member's response, sealed under the session key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponsePayload {
    Confirmed {
        key: [u8; 32],
        encryption_key: Option<[u8; 32]>,
        additional: Option<AdditionalData>,
    },
    Denied(ResponseStatus),
}

impl ResponsePayload {
    fn confirmed_flags(encryption_key: &Option<[u8; 32]>, additional: &Option<AdditionalData>) -> u64 {
        let mut f = 0;
        if encryption_key.is_some() {
            f |= flags::RESPONSE_ENCRYPTION_KEY;
        }
        if additional.is_some() {
            f |= flags::RESPONSE_ADDITIONAL;
        }
        f
    }
}

impl Codec for ResponsePayload {
    fn preencode(&self) -> usize {
        match self {
            Self::Denied(status) => uint_len(status.code()),
            Self::Confirmed {
                encryption_key,
                additional,
                ..
            } => {
                let mut len = uint_len(0)
                    + uint_len(Self::confirmed_flags(encryption_key, additional))
                    + 32;
                if encryption_key.is_some() {
                    len += 32;
                }
                if let Some(a) = additional {
                    len += a.preencode();
                }
                len
            }
        }
    }

    fn encode_into<B: BufMut>(&self, out: &mut B) {
        match self {
            Self::Denied(status) => put_uint(out, status.code()),
            Self::Confirmed {
                key,
                encryption_key,
                additional,
            } => {
                put_uint(out, 0);
                put_uint(out, Self::confirmed_flags(encryption_key, additional));
                out.put_slice(key);
                if let Some(k) = encryption_key {
                    out.put_slice(k);
                }
                if let Some(a) = additional {
                    a.encode_into(out);
                }
            }
        }
    }

    fn decode_from(src: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let status = src.uint()?;
        if status != 0 {
            return Ok(Self::Denied(ResponseStatus::from_code(status)?));
        }
        let f = src.uint()?;
        let key = src.fixed()?;
        let encryption_key = if f & flags::RESPONSE_ENCRYPTION_KEY != 0 {
            Some(src.fixed()?)
        } else {
            None
        };
        let additional = if f & flags::RESPONSE_ADDITIONAL != 0 {
            Some(AdditionalData::decode_from(src)?)
        } else {
            None
        };
        Ok(Self::Confirmed {
            key,
            encryption_key,
            additional,
        })
    }
}

/// Member -> candidate. Channel slot 1 and the reply mailbox slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteResponse {
    /// Request id this response answers.
    pub id: [u8; 32],
    /// Sealed [`ResponsePayload`].
    pub payload: Vec<u8>,
}

impl Codec for InviteResponse {
    fn preencode(&self) -> usize {
        32 + buffer_len(&self.payload)
    }

    fn encode_into<B: BufMut>(&self, out: &mut B) {
        out.put_slice(&self.id);
        put_buffer(out, &self.payload);
    }

    fn decode_from(src: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            id: src.fixed()?,
            payload: src.buffer()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Auth Envelope
// ---------------------------------------------------------------------------

/// Plaintext of [`RequestPayload::data`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteData {
    pub signature: [u8; SIGNATURE_LENGTH],
    pub user_data: Vec<u8>,
}

impl Codec for InviteData {
    fn preencode(&self) -> usize {
        SIGNATURE_LENGTH + buffer_len(&self.user_data)
    }

    fn encode_into<B: BufMut>(&self, out: &mut B) {
        out.put_slice(&self.signature);
        put_buffer(out, &self.user_data);
    }

    fn decode_from(src: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            signature: src.fixed()?,
            user_data: src.buffer()?,
        })
    }
}

/// Proof that a request was signed by the invite key: what a member keeps
/// after a successful open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteReceipt {
    pub session: [u8; 32],
    pub signature: [u8; SIGNATURE_LENGTH],
    pub user_data: Vec<u8>,
}

impl Codec for InviteReceipt {
    fn preencode(&self) -> usize {
        32 + SIGNATURE_LENGTH + buffer_len(&self.user_data)
    }

    fn encode_into<B: BufMut>(&self, out: &mut B) {
        out.put_slice(&self.session);
        out.put_slice(&self.signature);
        put_buffer(out, &self.user_data);
    }

    fn decode_from(src: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            session: src.fixed()?,
            signature: src.fixed()?,
            user_data: src.buffer()?,
        })
    }
}

/// The bytes covered by the request signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthData<'a> {
    pub session: &'a [u8; 32],
    pub user_data: &'a [u8],
}

impl AuthData<'_> {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(buffer_len(self.session) + buffer_len(self.user_data));
        put_buffer(&mut out, self.session);
        put_buffer(&mut out, self.user_data);
        out
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Reduced candidate request that survives a restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedRequest {
    pub seed: [u8; KEY_LENGTH],
    pub discovery_key: [u8; 32],
    pub user_data: Vec<u8>,
    /// Set once the request was accepted.
    pub key: Option<[u8; 32]>,
}

impl PersistedRequest {
    fn flags(&self) -> u64 {
        if self.key.is_some() {
            flags::PERSISTED_KEY
        } else {
            0
        }
    }
}

impl Codec for PersistedRequest {
    fn preencode(&self) -> usize {
        let mut len = uint_len(PERSISTED_REQUEST_VERSION)
            + uint_len(self.flags())
            + KEY_LENGTH
            + 32
            + buffer_len(&self.user_data);
        if self.key.is_some() {
            len += 32;
        }
        len
    }

    fn encode_into<B: BufMut>(&self, out: &mut B) {
        put_uint(out, PERSISTED_REQUEST_VERSION);
        put_uint(out, self.flags());
        out.put_slice(&self.seed);
        out.put_slice(&self.discovery_key);
        put_buffer(out, &self.user_data);
        if let Some(key) = &self.key {
            out.put_slice(key);
        }
    }

    fn decode_from(src: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = src.uint()?;
        if version != PERSISTED_REQUEST_VERSION {
            return Err(DecodeError::UnknownVersion(version));
        }
        let f = src.uint()?;
        Ok(Self {
            seed: src.fixed()?,
            discovery_key: src.fixed()?,
            user_data: src.buffer()?,
            key: if f & flags::PERSISTED_KEY != 0 {
                Some(src.fixed()?)
            } else {
                None
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> Invite {
        Invite {
            seed: [1u8; 32],
            discovery_key: Some([2u8; 32]),
            expires: Some(1_700_000_123_456),
            sensitive: true,
            test_invitation: false,
        }
    }

    #[test]
    fn invite_layout() {
        let bytes = invite().encode();
        assert_eq!(bytes.len(), 1 + 1 + 32 + 32 + 4);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], 0b0111);
        assert_eq!(&bytes[2..34], &[1u8; 32]);
    }

    #[test]
    fn invite_expiry_truncates_to_seconds() {
        let decoded = Invite::decode(&invite().encode()).unwrap();
        assert_eq!(decoded.expires, Some(1_700_000_123_000));
        assert_eq!(decoded.discovery_key, Some([2u8; 32]));
        assert!(decoded.sensitive);
        assert!(!decoded.test_invitation);
    }

    #[test]
    fn minimal_invite_has_no_optional_fields() {
        let minimal = Invite {
            seed: [9u8; 32],
            discovery_key: None,
            expires: None,
            sensitive: false,
            test_invitation: true,
        };
        let bytes = minimal.encode();
        assert_eq!(bytes.len(), 34);
        assert_eq!(bytes[1], 0b1000);
        assert_eq!(Invite::decode(&bytes).unwrap(), minimal);
    }

    #[test]
    fn unknown_invite_version_fails() {
        let mut bytes = invite().encode();
        bytes[0] = 2;
        assert_eq!(Invite::decode(&bytes), Err(DecodeError::UnknownVersion(2)));
    }

    #[test]
    fn denied_response_is_a_single_byte() {
        let denied = ResponsePayload::Denied(ResponseStatus::Used);
        assert_eq!(denied.encode(), vec![2]);
        assert_eq!(ResponsePayload::decode(&[2]).unwrap(), denied);
        assert_eq!(ResponsePayload::decode(&[9]), Err(DecodeError::UnknownStatus(9)));
    }

    #[test]
    fn confirmed_response_with_all_fields() {
        let payload = ResponsePayload::Confirmed {
            key: [3u8; 32],
            encryption_key: Some([4u8; 32]),
            additional: Some(AdditionalData {
                data: b"hello".to_vec(),
                signature: [5u8; 64],
            }),
        };
        let bytes = payload.encode();
        assert_eq!(bytes[..2], [0, 0b11]);
        assert_eq!(bytes.len(), 2 + 32 + 32 + 6 + 64);
        assert_eq!(ResponsePayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn request_session_must_be_32_bytes() {
        let mut bytes = vec![0u8; 32];
        put_buffer(&mut bytes, &[7u8; 16]);
        put_buffer(&mut bytes, b"data");
        assert_eq!(
            InviteRequest::decode(&bytes),
            Err(DecodeError::InvalidLength { expected: 32, got: 16 })
        );
    }

    #[test]
    fn auth_data_matches_buffer_layout() {
        let session = [6u8; 32];
        let encoded = AuthData {
            session: &session,
            user_data: b"alice",
        }
        .encode();
        assert_eq!(encoded[0], 32);
        assert_eq!(&encoded[1..33], &session);
        assert_eq!(&encoded[33..], b"\x05alice");
    }

    #[test]
    fn persisted_request_with_and_without_key() {
        let mut persisted = PersistedRequest {
            seed: [1u8; 32],
            discovery_key: [2u8; 32],
            user_data: b"alice".to_vec(),
            key: None,
        };
        assert_eq!(PersistedRequest::decode(&persisted.encode()).unwrap(), persisted);

        persisted.key = Some([3u8; 32]);
        let bytes = persisted.encode();
        assert_eq!(bytes[1], 1);
        assert_eq!(PersistedRequest::decode(&bytes).unwrap(), persisted);
    }
}

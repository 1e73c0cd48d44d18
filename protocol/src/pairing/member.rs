//! # Member Request
//!
//! The member's half of the handshake: an incoming request, opened with the
//! invite's public key and answered exactly once.
//!
//! ## State Machine
//!
//! ```text
//!              open(pk)            confirm(..)
//!   Created ────────────▶ Opened ─────────────▶ Confirmed
//!      │                    │
//!      │ deny(..)           │ deny(..)
//!      └────────────────────┴─────────────────▶ Denied
//! ```
//!
//! `confirm` on a request that was never opened is a no-op, as is any
//! decision on a request that is already `Confirmed` or `Denied`. A deny
//! before open has no reply key to seal under, so it produces no response.

use crate::config::KEY_LENGTH;
use crate::crypto::derive::{derive_request_id, derive_token};
use crate::error::{PairingError, Result};
use crate::wire::{
    AdditionalData, Codec, InviteRequest, InviteResponse, RequestPayload, ResponsePayload,
    ResponseStatus,
};

use super::auth::{create_reply, open_auth};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Opened,
    Confirmed,
    Denied,
}

/// A successful answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmation {
    pub key: [u8; 32],
    pub encryption_key: Option<[u8; 32]>,
    /// Invite additional data, forwarded as created.
    pub additional: Option<AdditionalData>,
}

impl Confirmation {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            encryption_key: None,
            additional: None,
        }
    }
}

/// How to refuse a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DenyStatus {
    /// Refuse without telling the candidate.
    Silent,
    #[default]
    Rejected,
    Used,
    Expired,
}

impl DenyStatus {
    fn wire_status(self) -> Option<ResponseStatus> {
        match self {
            DenyStatus::Silent => None,
            DenyStatus::Rejected => Some(ResponseStatus::Rejected),
            DenyStatus::Used => Some(ResponseStatus::Used),
            DenyStatus::Expired => Some(ResponseStatus::Expired),
        }
    }
}

#[derive(Clone, Debug)]
struct Opened {
    public_key: [u8; KEY_LENGTH],
    user_data: Vec<u8>,
    token: [u8; 32],
    id: [u8; 32],
    receipt: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct MemberRequest {
    invite_id: [u8; 32],
    request_data: RequestPayload,
    /// Bound by the transport the request arrived on.
    pub discovery_key: Option<[u8; 32]>,
    state: RequestState,
    opened: Option<Opened>,
    payload: Option<Vec<u8>>,
    response: Option<Vec<u8>>,
}

impl MemberRequest {
    pub fn from_request(request: InviteRequest) -> Self {
        Self {
            invite_id: request.invite_id,
            request_data: request.payload,
            discovery_key: None,
            state: RequestState::Created,
            opened: None,
            payload: None,
            response: None,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_request(InviteRequest::decode(bytes)?))
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn invite_id(&self) -> &[u8; 32] {
        &self.invite_id
    }

    /// Session token the candidate sent. Known before `open`.
    pub fn session(&self) -> &[u8; 32] {
        &self.request_data.session
    }

    pub fn public_key(&self) -> Option<&[u8; KEY_LENGTH]> {
        self.opened.as_ref().map(|o| &o.public_key)
    }

    pub fn user_data(&self) -> Option<&[u8]> {
        self.opened.as_ref().map(|o| o.user_data.as_slice())
    }

    pub fn token(&self) -> Option<&[u8; 32]> {
        self.opened.as_ref().map(|o| &o.token)
    }

    pub fn id(&self) -> Option<&[u8; 32]> {
        self.opened.as_ref().map(|o| &o.id)
    }

    /// Encoded [`InviteReceipt`](crate::wire::InviteReceipt).
    pub fn receipt(&self) -> Option<&[u8]> {
        self.opened.as_ref().map(|o| o.receipt.as_slice())
    }

    /// Decrypt and verify the request with the invite's public key.
    ///
    /// Repeating with the key that already opened it returns the cached
    /// user data.
    pub fn open(&mut self, public_key: &[u8; KEY_LENGTH]) -> Result<Vec<u8>> {
        if let Some(opened) = &self.opened {
            if &opened.public_key == public_key {
                return Ok(opened.user_data.clone());
            }
        }

        let receipt =
            open_auth(&self.request_data, public_key).map_err(|_| PairingError::InvalidInviteKey)?;

        let opened = Opened {
            public_key: *public_key,
            token: derive_token(public_key, &receipt.user_data),
            id: derive_request_id(&receipt.session),
            receipt: receipt.encode(),
            user_data: receipt.user_data,
        };
        let user_data = opened.user_data.clone();

        self.opened = Some(opened);
        if self.state == RequestState::Created {
            self.state = RequestState::Opened;
        }
        Ok(user_data)
    }

    /// Accept the request. Only takes effect on an opened, undecided request.
    pub fn confirm(&mut self, confirmation: Confirmation) -> Result<()> {
        if self.state != RequestState::Opened {
            return Ok(());
        }
        let payload = ResponsePayload::Confirmed {
            key: confirmation.key,
            encryption_key: confirmation.encryption_key,
            additional: confirmation.additional,
        };
        self.seal(&payload)?;
        self.state = RequestState::Confirmed;
        Ok(())
    }

    /// Refuse the request. Only takes effect on an undecided request.
    pub fn deny(&mut self, status: DenyStatus) -> Result<()> {
        match self.state {
            RequestState::Confirmed | RequestState::Denied => return Ok(()),
            RequestState::Created | RequestState::Opened => {}
        }
        if let (Some(status), true) = (status.wire_status(), self.opened.is_some()) {
            self.seal(&ResponsePayload::Denied(status))?;
        }
        self.state = RequestState::Denied;
        Ok(())
    }

    fn seal(&mut self, payload: &ResponsePayload) -> Result<()> {
        let opened = self.opened.as_ref().ok_or(PairingError::RequestClosed)?;
        let sealed = create_reply(payload, &self.request_data.session, &opened.public_key)?;
        let response = InviteResponse {
            id: opened.id,
            payload: sealed.clone(),
        };
        self.payload = Some(sealed);
        self.response = Some(response.encode());
        Ok(())
    }

    /// The response message, once a decision produced one.
    pub fn respond(&self) -> Option<InviteResponse> {
        let id = self.opened.as_ref()?.id;
        Some(InviteResponse {
            id,
            payload: self.payload.clone()?,
        })
    }

    /// Encoded response, once a decision produced one.
    pub fn response(&self) -> Option<&[u8]> {
        self.response.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::candidate::{CandidateRequest, Capability, ResponseOutcome};
    use crate::pairing::invite::{create_invite, CreatedInvite, InviteOptions};

    const KEY: [u8; 32] = [7u8; 32];

    fn setup() -> (CreatedInvite, CandidateRequest, MemberRequest) {
        let created = create_invite(&KEY, InviteOptions::default());
        let candidate = CandidateRequest::from_invite_bytes(&created.invite, b"alice").unwrap();
        let member = MemberRequest::from_bytes(candidate.encode().unwrap()).unwrap();
        (created, candidate, member)
    }

    #[test]
    fn open_recovers_user_data() {
        let (created, candidate, mut member) = setup();
        assert_eq!(member.state(), RequestState::Created);
        assert_eq!(member.invite_id(), &created.id);
        assert_eq!(member.open(&created.public_key).unwrap(), b"alice");
        assert_eq!(member.state(), RequestState::Opened);
        assert_eq!(member.token(), candidate.token());
        assert_eq!(member.id(), Some(candidate.id()));

        // Idempotent.
        assert_eq!(member.open(&created.public_key).unwrap(), b"alice");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let (_, _, mut member) = setup();
        let other = crate::crypto::KeyPair::generate().public_key();
        assert_eq!(member.open(&other), Err(PairingError::InvalidInviteKey));
        assert_eq!(member.state(), RequestState::Created);
    }

    #[test]
    fn confirm_is_one_shot() {
        let (created, mut candidate, mut member) = setup();
        member.open(&created.public_key).unwrap();
        member.confirm(Confirmation::new(KEY)).unwrap();
        let first = member.response().unwrap().to_vec();

        member.confirm(Confirmation::new([1u8; 32])).unwrap();
        member.deny(DenyStatus::Rejected).unwrap();
        assert_eq!(member.state(), RequestState::Confirmed);
        assert_eq!(member.response().unwrap(), first.as_slice());

        assert_eq!(
            candidate.handle_response(&first),
            ResponseOutcome::Accepted(Capability {
                key: KEY,
                encryption_key: None,
                data: None,
            })
        );
    }

    #[test]
    fn confirm_before_open_is_ignored() {
        let (_, _, mut member) = setup();
        member.confirm(Confirmation::new(KEY)).unwrap();
        assert_eq!(member.state(), RequestState::Created);
        assert!(member.response().is_none());
    }

    #[test]
    fn deny_produces_status_response() {
        let (created, mut candidate, mut member) = setup();
        member.open(&created.public_key).unwrap();
        member.deny(DenyStatus::Expired).unwrap();
        assert_eq!(member.state(), RequestState::Denied);

        let response = member.respond().unwrap();
        assert_eq!(&response.id, candidate.id());
        assert_eq!(
            candidate.handle_response(member.response().unwrap()),
            ResponseOutcome::Rejected(PairingError::InviteExpired)
        );
        assert!(candidate.auth().is_none());
    }

    #[test]
    fn silent_deny_sends_nothing() {
        let (created, _, mut member) = setup();
        member.open(&created.public_key).unwrap();
        member.deny(DenyStatus::Silent).unwrap();
        assert_eq!(member.state(), RequestState::Denied);
        assert!(member.response().is_none());
        assert!(member.respond().is_none());

        member.confirm(Confirmation::new(KEY)).unwrap();
        assert!(member.response().is_none());
    }

    #[test]
    fn deny_before_open_has_no_response() {
        let (created, _, mut member) = setup();
        member.deny(DenyStatus::Rejected).unwrap();
        assert_eq!(member.state(), RequestState::Denied);
        assert!(member.response().is_none());

        // Opening afterwards is still allowed but the decision stands.
        member.open(&created.public_key).unwrap();
        assert_eq!(member.state(), RequestState::Denied);
    }

    #[test]
    fn malformed_request_fails_to_decode() {
        assert!(matches!(
            MemberRequest::from_bytes(&[0u8; 10]),
            Err(PairingError::Decode(_))
        ));
    }
}

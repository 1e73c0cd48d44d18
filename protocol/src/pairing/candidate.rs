//! # Candidate Request
//!
//! The candidate's half of the handshake. Built from an invite and the
//! user data the candidate wants the member to see, it carries a sealed
//! request ready to send and knows how to open the member's answer.
//!
//! A request is single-use: once a response is accepted its token and
//! payload are cleared and further responses are refused.

use once_cell::sync::OnceCell;
use tokio::sync::broadcast;
use tracing::debug;

use crate::crypto::derive::{
    create_session_token, derive_ephemeral_key_pair, derive_invite_id, derive_reply_key_pair,
    derive_request_id, derive_token,
};
use crate::crypto::{discovery_key, verify, KeyPair};
use crate::error::{PairingError, Result};
use crate::wire::{
    Codec, Invite, InviteRequest, InviteResponse, PersistedRequest, RequestPayload,
    ResponsePayload, ResponseStatus,
};

use super::auth::{create_auth, open_reply};

/// What an accepted pairing hands the candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    pub key: [u8; 32],
    pub encryption_key: Option<[u8; 32]>,
    /// Additional data from the invite creator, already verified.
    pub data: Option<Vec<u8>>,
}

/// Lifecycle notifications from a [`CandidateRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestEvent {
    Accepted(Capability),
    Rejected(PairingError),
    Destroyed,
}

/// Result of feeding one response to [`CandidateRequest::handle_response`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseOutcome {
    Accepted(Capability),
    Rejected(PairingError),
}

const EVENT_CAPACITY: usize = 16;

pub struct CandidateRequest {
    discovery_key: [u8; 32],
    seed: [u8; 32],
    key_pair: KeyPair,
    invite_id: [u8; 32],
    user_data: Vec<u8>,
    token: Option<[u8; 32]>,
    session: [u8; 32],
    id: [u8; 32],
    payload: Option<RequestPayload>,
    encoded: OnceCell<Vec<u8>>,
    auth: Option<Capability>,
    /// Resource key of a request restored after it completed.
    key: Option<[u8; 32]>,
    events: broadcast::Sender<RequestEvent>,
}

impl CandidateRequest {
    /// Build a request from a decoded invite.
    ///
    /// `session` overrides the derived session token.
    pub fn new(invite: &Invite, user_data: &[u8], session: Option<[u8; 32]>) -> Result<Self> {
        let discovery_key = invite.discovery_key.ok_or(PairingError::MissingDiscoveryKey)?;
        let key_pair = KeyPair::from_seed(&invite.seed);
        let public_key = key_pair.public_key();

        let token = derive_token(&public_key, user_data);
        let session = session.unwrap_or_else(|| create_session_token(&token));
        let payload = create_auth(user_data, &key_pair, &session)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            discovery_key,
            seed: invite.seed,
            invite_id: derive_invite_id(&public_key),
            key_pair,
            user_data: user_data.to_vec(),
            token: Some(token),
            id: derive_request_id(&session),
            session,
            payload: Some(payload),
            encoded: OnceCell::new(),
            auth: None,
            key: None,
            events,
        })
    }

    /// Build a request from encoded invite bytes.
    pub fn from_invite_bytes(invite: &[u8], user_data: &[u8]) -> Result<Self> {
        Self::new(&Invite::decode(invite)?, user_data, None)
    }

    /// Rebuild a request saved with [`CandidateRequest::persist`].
    pub fn restore(bytes: &[u8]) -> Result<Self> {
        let persisted = PersistedRequest::decode(bytes)?;
        let invite = Invite {
            seed: persisted.seed,
            discovery_key: Some(persisted.discovery_key),
            expires: None,
            sensitive: false,
            test_invitation: false,
        };
        let mut request = Self::new(&invite, &persisted.user_data, None)?;

        if let Some(key) = persisted.key {
            request.key = Some(key);
            request.token = None;
            request.payload = None;
        }
        Ok(request)
    }

    /// Reduced form that survives a restart.
    pub fn persist(&self) -> Vec<u8> {
        PersistedRequest {
            seed: self.seed,
            discovery_key: self.discovery_key,
            user_data: self.user_data.clone(),
            key: self.key.or_else(|| self.auth.as_ref().map(|a| a.key)),
        }
        .encode()
    }

    pub fn discovery_key(&self) -> &[u8; 32] {
        &self.discovery_key
    }

    pub fn invite_id(&self) -> &[u8; 32] {
        &self.invite_id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key_pair.public_key()
    }

    pub fn user_data(&self) -> &[u8] {
        &self.user_data
    }

    pub fn session(&self) -> &[u8; 32] {
        &self.session
    }

    pub fn id(&self) -> &[u8; 32] {
        &self.id
    }

    /// `None` once the request has completed.
    pub fn token(&self) -> Option<&[u8; 32]> {
        self.token.as_ref()
    }

    pub fn payload(&self) -> Option<&RequestPayload> {
        self.payload.as_ref()
    }

    /// Capability set by a successful response.
    pub fn auth(&self) -> Option<&Capability> {
        self.auth.as_ref()
    }

    /// Whether the request completed, in this process or before a restore.
    pub fn is_completed(&self) -> bool {
        self.auth.is_some() || self.key.is_some()
    }

    /// Mailbox key pair the member answers at.
    pub fn reply_key_pair(&self) -> Option<KeyPair> {
        self.token.as_ref().map(derive_reply_key_pair)
    }

    /// Mailbox key pair this request is published at.
    pub fn ephemeral_key_pair(&self) -> Option<KeyPair> {
        self.token.as_ref().map(derive_ephemeral_key_pair)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.events.subscribe()
    }

    /// Encoded [`InviteRequest`]. Computed once.
    pub fn encode(&self) -> Result<&[u8]> {
        if let Some(encoded) = self.encoded.get() {
            return Ok(encoded);
        }
        let payload = self.payload.as_ref().ok_or(PairingError::RequestClosed)?;
        let encoded = self.encoded.get_or_init(|| {
            InviteRequest {
                invite_id: self.invite_id,
                payload: payload.clone(),
            }
            .encode()
        });
        Ok(encoded)
    }

    /// Process one encoded [`InviteResponse`].
    ///
    /// Never fails outright: every problem is reported as
    /// [`ResponseOutcome::Rejected`] and broadcast as a rejected event.
    pub fn handle_response(&mut self, bytes: &[u8]) -> ResponseOutcome {
        if self.payload.is_none() {
            return ResponseOutcome::Rejected(PairingError::RequestClosed);
        }

        match self.open_response(bytes) {
            Ok(capability) => {
                self.auth = Some(capability.clone());
                let _ = self.events.send(RequestEvent::Accepted(capability.clone()));
                self.destroy();
                ResponseOutcome::Accepted(capability)
            }
            Err(err) => {
                debug!(error = %err, request = %hex::encode(&self.id[..8]), "response rejected");
                let _ = self.events.send(RequestEvent::Rejected(err.clone()));
                ResponseOutcome::Rejected(err)
            }
        }
    }

    fn open_response(&self, bytes: &[u8]) -> Result<Capability> {
        let response = InviteResponse::decode(bytes)?;
        let payload = open_reply(&response.payload, &self.session, &self.key_pair.public_key())?;

        let (key, encryption_key, additional) = match payload {
            ResponsePayload::Denied(ResponseStatus::Rejected) => {
                return Err(PairingError::PairingRejected)
            }
            ResponsePayload::Denied(ResponseStatus::Used) => return Err(PairingError::InviteUsed),
            ResponsePayload::Denied(ResponseStatus::Expired) => {
                return Err(PairingError::InviteExpired)
            }
            ResponsePayload::Confirmed {
                key,
                encryption_key,
                additional,
            } => (key, encryption_key, additional),
        };

        if discovery_key(&key) != self.discovery_key {
            return Err(PairingError::DiscoveryKeyMismatch);
        }

        if let Some(additional) = &additional {
            if !verify(
                &self.key_pair.public_key(),
                &additional.data,
                &additional.signature,
            ) {
                return Err(PairingError::SignatureInvalid);
            }
        }

        Ok(Capability {
            key,
            encryption_key,
            data: additional.map(|a| a.data),
        })
    }

    /// Clear the token and payload. The memoized encoding survives.
    pub fn destroy(&mut self) {
        self.token = None;
        self.payload = None;
        let _ = self.events.send(RequestEvent::Destroyed);
    }
}

impl std::fmt::Debug for CandidateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateRequest")
            .field("discovery_key", &hex::encode(self.discovery_key))
            .field("id", &hex::encode(self.id))
            .field("completed", &self.is_completed())
            .finish()
    }
}

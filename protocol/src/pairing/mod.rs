//! # The Pairing Handshake
//!
//! Transport-agnostic request/response objects. Nothing here touches the
//! network: a [`CandidateRequest`] produces bytes, a [`MemberRequest`]
//! consumes them and produces an answer, and the candidate opens it.
//!
//! ```text
//! Candidate                                     Member
//!    │  create_invite(key) ── out-of-band ──▶      │ (keeps public key)
//!    │                                             │
//!    │  CandidateRequest::new(invite, user_data)   │
//!    │ ───────────── InviteRequest ──────────────▶ │ MemberRequest::from_bytes
//!    │                                             │ open(pk) -> user_data
//!    │                                             │ confirm / deny
//!    │ ◀──────────── InviteResponse ────────────── │
//!    │  handle_response -> Capability              │
//! ```

pub mod auth;
pub mod candidate;
pub mod invite;
pub mod member;

pub use candidate::{CandidateRequest, Capability, RequestEvent, ResponseOutcome};
pub use invite::{
    create_invite, create_receipt, decode_invite, verify_decoded_receipt, verify_receipt,
    CreatedInvite, CreatedReceipt, DecodedInvite, InviteOptions,
};
pub use member::{Confirmation, DenyStatus, MemberRequest, RequestState};

// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Blind Pairing
//!
//! Invite-based pairing between an existing member of a peer-to-peer
//! resource and a new candidate. The member hands out an invite; the
//! candidate uses it to prove it holds the invite and to receive the
//! resource key, without either side learning anything about the other
//! beyond what the invite binds.
//!
//! Requests travel over two paths at once: directly on swarm channels
//! opened for the resource's discovery key, and through DHT mailboxes for
//! when the two peers never manage to connect.
//!
//! ## Architecture
//!
//! - **crypto**: Hash namespaces, Ed25519 keys, XChaCha20-Poly1305 and the
//!   protocol's key derivations.
//! - **wire**: Compact binary encoding of every message.
//! - **pairing**: The synchronous handshake: invites, candidate requests,
//!   member requests, receipts.
//! - **rendezvous**: The async orchestration: registry, member and
//!   candidate sessions, transport traits.
//! - **memory**: In-process DHT and swarm for tests and demos.
//! - **config**: Protocol constants and tunable intervals.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use blind_pairing::memory::{MemoryDht, MemorySwarm};
//! use blind_pairing::pairing::{create_invite, CandidateRequest, InviteOptions};
//! use blind_pairing::rendezvous::{BlindPairing, CandidateOptions};
//! use blind_pairing::PairingConfig;
//!
//! # async fn run() -> blind_pairing::Result<()> {
//! let swarm = Arc::new(MemorySwarm::new(Arc::new(MemoryDht::new())));
//! let pairing = BlindPairing::new(swarm, PairingConfig::default());
//!
//! let invite = create_invite(&[7u8; 32], InviteOptions::default());
//! let request = CandidateRequest::from_invite_bytes(&invite.invite, b"hello")?;
//! let candidate = pairing.add_candidate(request, CandidateOptions::default())?;
//! let outcome = candidate.outcome().await;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod memory;
pub mod pairing;
pub mod rendezvous;
pub mod wire;

pub use config::PairingConfig;
pub use error::{PairingError, Result};
pub use pairing::{
    create_invite, create_receipt, decode_invite, verify_receipt, CandidateRequest, Capability,
    Confirmation, DenyStatus, InviteOptions, MemberRequest, RequestState,
};
pub use rendezvous::{
    BlindPairing, Candidate, CandidateOptions, Member, MemberOptions, PairedHandler,
    PairingOutcome, RequestHandler,
};

//! # Rendezvous
//!
//! Everything that moves pairing messages between peers: the registry that
//! owns one entry per discovery key, the long-running member and candidate
//! sessions, and the transport traits they run over.
//!
//! ```text
//!                      ┌──────────────────────┐
//!   swarm connection ─▶│     BlindPairing     │◀─ DHT (lookup, mutable slots)
//!                      │  entry per disc. key │
//!                      └──────┬────────┬──────┘
//!                             │        │
//!                   ┌─────────▼─┐    ┌─▼──────────┐
//!                   │  Member   │    │ Candidate  │
//!                   │ (answers) │    │ (requests) │
//!                   └───────────┘    └────────────┘
//! ```

pub mod candidate;
pub mod member;
pub mod registry;
pub mod seen;
pub mod timeout;
pub mod transport;

pub use candidate::{Candidate, CandidateOptions, PairedHandler, PairingOutcome};
pub use member::{Member, MemberOptions, RequestHandler};
pub use registry::BlindPairing;
pub use seen::SeenCache;
pub use timeout::{random_interval, Timeout};
pub use transport::{
    ChannelListener, Connection, Dht, DhtError, Discovery, JoinOptions, LookupQuery, LookupReply,
    NodeAddr, PairHandler, PairingChannel, Swarm,
};

/// First eight bytes as hex, for log fields.
pub(crate) fn short(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(8)])
}

//! # Protocol Configuration & Constants
//!
//! Every magic number in blind pairing lives here. The namespace names and
//! wire constants are part of the protocol: two peers that disagree on any
//! of them will derive different mailbox slots and never find each other.
//!
//! Runtime knobs (poll cadence, cache sizes) are grouped in
//! [`PairingConfig`], which the registry takes at construction time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol Identifiers
// ---------------------------------------------------------------------------

/// Name of the multiplexed channel protocol. Channels are opened with
/// `id = discovery_key` under this name.
pub const PROTOCOL_NAME: &str = "blind-pairing";

/// Namespace for the eight handshake tags (signature, token, invite id,
/// request id, session, session key, encrypt, nonce).
pub const CORE_NAMESPACE: &str = "blind-pairing";

/// Namespace for the three rendezvous tags (ephemeral, reply, discovery).
pub const DHT_NAMESPACE: &str = "blind-pairing/dht";

/// Message that is keyed with a resource key to produce its discovery key.
pub const DISCOVERY_KEY_MESSAGE: &[u8] = b"hypercore";

/// The only invite encoding version we understand.
pub const INVITE_VERSION: u64 = 1;

/// Encoding version of a persisted candidate request.
pub const PERSISTED_REQUEST_VERSION: u64 = 1;

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Length of every hash, seed, public key and symmetric key.
pub const KEY_LENGTH: usize = 32;

/// Ed25519 signature length.
pub const SIGNATURE_LENGTH: usize = 64;

/// XChaCha20-Poly1305 nonce length (192 bits).
pub const NONCE_LENGTH: usize = 24;

/// Poly1305 authentication tag length.
pub const TAG_LENGTH: usize = 16;

// ---------------------------------------------------------------------------
// Timing & Cache Defaults
// ---------------------------------------------------------------------------

/// Base interval between mailbox polls. Each session jitters it by up to
/// half in either direction.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(7 * 60);

/// Base interval a candidate waits on one direct channel before it tries
/// the next one.
pub const DEFAULT_PEER_INTERVAL: Duration = Duration::from_secs(1);

/// Peers whose mailbox a member has already read. Bounded so a busy topic
/// cannot grow it without limit.
pub const DEFAULT_SEEN_CACHE_SIZE: usize = 512;

/// Decided requests a member remembers so that late retransmissions are
/// answered with the original response instead of a fresh decision.
pub const DEFAULT_DECIDED_CACHE_SIZE: usize = 256;

/// How long a registry entry with no member, no candidate and only
/// remotely-opened channels survives before [`compact`] drops it.
///
/// [`compact`]: crate::rendezvous::BlindPairing::compact
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Tunable parameters for a [`BlindPairing`](crate::rendezvous::BlindPairing)
/// registry.
///
/// Durations serialize as whole milliseconds so the struct round-trips
/// through JSON or TOML config files without custom formats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Base interval between mailbox polls.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Base interval spent on each direct channel while broadcasting.
    #[serde(with = "duration_ms")]
    pub peer_interval: Duration,
    /// Capacity of the member's seen-peer cache.
    pub seen_cache_size: usize,
    /// Capacity of the member's decided-request cache.
    pub decided_cache_size: usize,
    /// Grace period for idle registry entries.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            peer_interval: DEFAULT_PEER_INTERVAL,
            seen_cache_size: DEFAULT_SEEN_CACHE_SIZE,
            decided_cache_size: DEFAULT_DECIDED_CACHE_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl PairingConfig {
    /// Override the base poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the per-channel broadcast interval.
    pub fn with_peer_interval(mut self, interval: Duration) -> Self {
        self.peer_interval = interval;
        self
    }

    /// Override the idle-entry grace period.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

//! # Transport Seams
//!
//! Blind pairing consumes two external systems and builds neither:
//!
//! - A **DHT** with topic announce/lookup and signed mutable slots. It is
//!   public, eventually consistent and best-effort; nothing read from it is
//!   trusted beyond the value's own cryptographic envelope.
//! - A **swarm** of multiplexed connections on which `blind-pairing`
//!   channels are opened, one per discovery key, with two message slots
//!   (0 = request, 1 = response).
//!
//! Both are expressed as traits so the registry can run over a real
//! network or over [`crate::memory`] in tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::crypto::KeyPair;

/// DHT and swarm failures. Always recoverable from the protocol's point of
/// view: the next poll simply tries again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DhtError {
    #[error("network error: {0}")]
    Network(String),

    #[error("query aborted")]
    Aborted,

    #[error("dht closed")]
    Closed,
}

/// A DHT node address, used as a routing hint for the next lookup.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Peers announced under a topic, as returned by one DHT node.
#[derive(Clone, Debug, Default)]
pub struct LookupReply {
    pub peers: Vec<[u8; 32]>,
}

/// An in-flight lookup. Dropping it cancels the query.
pub trait LookupQuery: Stream<Item = Result<LookupReply, DhtError>> + Send + Unpin {
    /// Closest nodes seen so far.
    fn closest_nodes(&self) -> Vec<NodeAddr>;
}

#[async_trait]
pub trait Dht: Send + Sync {
    fn lookup(&self, topic: &[u8; 32], closest_nodes: Option<Vec<NodeAddr>>) -> Box<dyn LookupQuery>;

    async fn announce(&self, topic: &[u8; 32], key_pair: &KeyPair) -> Result<(), DhtError>;

    async fn unannounce(&self, topic: &[u8; 32], key_pair: &KeyPair) -> Result<(), DhtError>;

    /// Latest value stored under `public_key`, if any.
    async fn mutable_get(&self, public_key: &[u8; 32]) -> Result<Option<Vec<u8>>, DhtError>;

    async fn mutable_put(&self, key_pair: &KeyPair, value: &[u8]) -> Result<(), DhtError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JoinOptions {
    pub server: bool,
    pub client: bool,
}

/// Handle to an active swarm join.
#[async_trait]
pub trait Discovery: Send + Sync {
    fn is_server(&self) -> bool;

    fn is_client(&self) -> bool;

    /// Resolves once the join has been fully announced.
    async fn flushed(&self) -> Result<(), DhtError>;

    async fn destroy(&self) -> Result<(), DhtError>;
}

#[async_trait]
pub trait Swarm: Send + Sync {
    fn dht(&self) -> Arc<dyn Dht>;

    fn join(&self, topic: &[u8; 32], options: JoinOptions) -> Arc<dyn Discovery>;

    /// Resolves once pending joins and connections have settled.
    async fn flush(&self) -> Result<(), DhtError>;

    fn connections(&self) -> Vec<Arc<dyn Connection>>;
}

/// One open `blind-pairing` channel.
pub trait PairingChannel: Send + Sync {
    /// Unique within the process.
    fn id(&self) -> u64;

    fn discovery_key(&self) -> [u8; 32];

    /// Slot 0.
    fn send_request(&self, request: &[u8]);

    /// Slot 1.
    fn send_response(&self, response: &[u8]);

    /// Round-trip time of the underlying connection.
    fn rtt(&self) -> Duration;

    fn close(&self);
}

/// Receives messages for one channel. Called from the transport without
/// any registry lock held; implementations must not block.
pub trait ChannelListener: Send + Sync {
    fn on_request(&self, channel: Arc<dyn PairingChannel>, request: Vec<u8>);

    fn on_response(&self, channel: Arc<dyn PairingChannel>, response: Vec<u8>);

    fn on_close(&self, channel_id: u64);
}

/// Notified when the remote side opens a channel we have not opened.
pub trait PairHandler: Send + Sync {
    fn on_remote_open(&self, connection: Arc<dyn Connection>, discovery_key: [u8; 32]);
}

/// A multiplexed connection to one peer.
pub trait Connection: Send + Sync {
    fn id(&self) -> u64;

    /// Open the channel for `discovery_key`. `None` if one is already open
    /// on this connection.
    fn open_channel(
        &self,
        discovery_key: &[u8; 32],
        listener: Arc<dyn ChannelListener>,
    ) -> Option<Arc<dyn PairingChannel>>;

    fn pair(&self, handler: Arc<dyn PairHandler>);

    fn unpair(&self);
}

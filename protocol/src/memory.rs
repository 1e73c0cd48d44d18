//! # In-Memory Transport
//!
//! A DHT and swarm that live entirely in process, for tests, benches and
//! the CLI demo. Several [`MemorySwarm`]s share one [`MemoryDht`], and
//! [`MemorySwarm::connect`] links two swarms with a connection of a given
//! round-trip time.
//!
//! Mutable slots are signed on put and verified, like on a real DHT.
//! Lookups can be held open with [`MemoryDht::hold_lookups`] to stand in
//! for a slow network.
//! Messages written to a channel the remote side has not opened yet are
//! buffered and delivered when it does.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use indexmap::IndexSet;
use parking_lot::Mutex;
use tracing::trace;

use crate::crypto::{verify, KeyPair};
use crate::rendezvous::transport::{
    ChannelListener, Connection, Dht, DhtError, Discovery, JoinOptions, LookupQuery, LookupReply,
    NodeAddr, PairHandler, PairingChannel, Swarm,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Peers returned per simulated DHT node.
const PEERS_PER_REPLY: usize = 20;

#[derive(Default)]
struct DhtState {
    topics: HashMap<[u8; 32], IndexSet<[u8; 32]>>,
    announces: HashMap<[u8; 32], usize>,
    slots: HashMap<[u8; 32], (Vec<u8>, [u8; 64])>,
    offline: bool,
    lookups: usize,
    gate: Option<Arc<LookupGate>>,
}

/// Holds lookups pending until opened.
#[derive(Default)]
struct LookupGate {
    state: Mutex<(bool, Vec<Waker>)>,
}

impl LookupGate {
    fn poll_open(&self, cx: &mut Context<'_>) -> bool {
        let mut state = self.state.lock();
        if !state.0 {
            state.1.push(cx.waker().clone());
        }
        state.0
    }

    fn open(&self) {
        let wakers = {
            let mut state = self.state.lock();
            state.0 = true;
            std::mem::take(&mut state.1)
        };
        wakers.into_iter().for_each(Waker::wake);
    }
}

#[derive(Default)]
pub struct MemoryDht {
    state: Mutex<DhtState>,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Lookups started from now on yield nothing until
    /// [`release_lookups`](Self::release_lookups).
    pub fn hold_lookups(&self) {
        let mut state = self.state.lock();
        if state.gate.is_none() {
            state.gate = Some(Arc::new(LookupGate::default()));
        }
    }

    pub fn release_lookups(&self) {
        let gate = self.state.lock().gate.take();
        if let Some(gate) = gate {
            gate.open();
        }
    }

    /// Lookups started so far.
    pub fn lookup_count(&self) -> usize {
        self.state.lock().lookups
    }

    /// Value stored under `public_key`.
    pub fn stored(&self, public_key: &[u8; 32]) -> Option<Vec<u8>> {
        self.state
            .lock()
            .slots
            .get(public_key)
            .map(|(value, _)| value.clone())
    }

    pub fn is_announced(&self, topic: &[u8; 32], public_key: &[u8; 32]) -> bool {
        self.state
            .lock()
            .topics
            .get(topic)
            .map_or(false, |peers| peers.contains(public_key))
    }

    /// How many announces `topic` has received in total.
    pub fn announce_count(&self, topic: &[u8; 32]) -> usize {
        self.state.lock().announces.get(topic).copied().unwrap_or(0)
    }

    fn online(&self) -> Result<parking_lot::MutexGuard<'_, DhtState>, DhtError> {
        let state = self.state.lock();
        if state.offline {
            return Err(DhtError::Network("dht offline".into()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Dht for MemoryDht {
    fn lookup(&self, topic: &[u8; 32], _closest_nodes: Option<Vec<NodeAddr>>) -> Box<dyn LookupQuery> {
        let mut replies = VecDeque::new();
        let mut state = self.state.lock();
        state.lookups += 1;
        if state.offline {
            replies.push_back(Err(DhtError::Network("dht offline".into())));
        } else {
            let peers: Vec<[u8; 32]> = state
                .topics
                .get(topic)
                .map(|peers| peers.iter().copied().collect())
                .unwrap_or_default();
            for chunk in peers.chunks(PEERS_PER_REPLY) {
                replies.push_back(Ok(LookupReply {
                    peers: chunk.to_vec(),
                }));
            }
        }
        Box::new(MemoryLookup {
            replies,
            gate: state.gate.clone(),
            closest: vec![NodeAddr {
                host: "127.0.0.1".into(),
                port: 49737,
            }],
        })
    }

    async fn announce(&self, topic: &[u8; 32], key_pair: &KeyPair) -> Result<(), DhtError> {
        let mut state = self.online()?;
        state
            .topics
            .entry(*topic)
            .or_default()
            .insert(key_pair.public_key());
        *state.announces.entry(*topic).or_default() += 1;
        Ok(())
    }

    async fn unannounce(&self, topic: &[u8; 32], key_pair: &KeyPair) -> Result<(), DhtError> {
        let mut state = self.online()?;
        if let Some(peers) = state.topics.get_mut(topic) {
            peers.shift_remove(&key_pair.public_key());
        }
        Ok(())
    }

    async fn mutable_get(&self, public_key: &[u8; 32]) -> Result<Option<Vec<u8>>, DhtError> {
        let state = self.online()?;
        Ok(state
            .slots
            .get(public_key)
            .filter(|(value, signature)| verify(public_key, value, signature))
            .map(|(value, _)| value.clone()))
    }

    async fn mutable_put(&self, key_pair: &KeyPair, value: &[u8]) -> Result<(), DhtError> {
        let signature = key_pair.sign(value);
        let mut state = self.online()?;
        state
            .slots
            .insert(key_pair.public_key(), (value.to_vec(), signature));
        Ok(())
    }
}

pub struct MemoryLookup {
    replies: VecDeque<Result<LookupReply, DhtError>>,
    closest: Vec<NodeAddr>,
    gate: Option<Arc<LookupGate>>,
}

impl Stream for MemoryLookup {
    type Item = Result<LookupReply, DhtError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(gate) = &this.gate {
            if !gate.poll_open(cx) {
                return Poll::Pending;
            }
        }
        Poll::Ready(this.replies.pop_front())
    }
}

impl LookupQuery for MemoryLookup {
    fn closest_nodes(&self) -> Vec<NodeAddr> {
        self.closest.clone()
    }
}

pub struct MemoryDiscovery {
    options: JoinOptions,
    destroyed: AtomicBool,
}

impl MemoryDiscovery {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    fn is_server(&self) -> bool {
        self.options.server
    }

    fn is_client(&self) -> bool {
        self.options.client
    }

    async fn flushed(&self) -> Result<(), DhtError> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), DhtError> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemorySwarm {
    dht: Arc<MemoryDht>,
    joins: Mutex<HashMap<[u8; 32], Vec<JoinOptions>>>,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
}

impl MemorySwarm {
    pub fn new(dht: Arc<MemoryDht>) -> Self {
        Self {
            dht,
            joins: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Options of the most recent join for `topic`.
    pub fn last_join(&self, topic: &[u8; 32]) -> Option<JoinOptions> {
        self.joins.lock().get(topic).and_then(|j| j.last().copied())
    }

    pub fn join_count(&self, topic: &[u8; 32]) -> usize {
        self.joins.lock().get(topic).map_or(0, Vec::len)
    }

    /// Link two swarms. Each side still has to hand its end to its
    /// registry's `on_connection`.
    pub fn connect(
        a: &MemorySwarm,
        b: &MemorySwarm,
        rtt: Duration,
    ) -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
        let (left, right) = MemoryConnection::pair(rtt);
        a.connections.lock().push(left.clone());
        b.connections.lock().push(right.clone());
        (left, right)
    }
}

#[async_trait]
impl Swarm for MemorySwarm {
    fn dht(&self) -> Arc<dyn Dht> {
        self.dht.clone()
    }

    fn join(&self, topic: &[u8; 32], options: JoinOptions) -> Arc<dyn Discovery> {
        self.joins.lock().entry(*topic).or_default().push(options);
        Arc::new(MemoryDiscovery {
            options,
            destroyed: AtomicBool::new(false),
        })
    }

    async fn flush(&self) -> Result<(), DhtError> {
        Ok(())
    }

    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections
            .lock()
            .iter()
            .filter(|c| !c.is_closed())
            .map(|c| c.clone() as Arc<dyn Connection>)
            .collect()
    }
}

enum Message {
    Request(Vec<u8>),
    Response(Vec<u8>),
}

#[derive(Default)]
struct ConnectionState {
    channels: HashMap<[u8; 32], Arc<MemoryChannel>>,
    /// Arrived before the local side opened the channel.
    pending: HashMap<[u8; 32], Vec<Message>>,
    handler: Option<Arc<dyn PairHandler>>,
    closed: bool,
}

/// One end of an in-memory connection.
pub struct MemoryConnection {
    id: u64,
    rtt: Duration,
    remote: Mutex<Weak<MemoryConnection>>,
    state: Mutex<ConnectionState>,
    this: Weak<MemoryConnection>,
}

impl MemoryConnection {
    /// Two linked ends.
    pub fn pair(rtt: Duration) -> (Arc<Self>, Arc<Self>) {
        let make = || {
            Arc::new_cyclic(|this| Self {
                id: next_id(),
                rtt,
                remote: Mutex::new(Weak::new()),
                state: Mutex::new(ConnectionState::default()),
                this: this.clone(),
            })
        };
        let (left, right) = (make(), make());
        *left.remote.lock() = Arc::downgrade(&right);
        *right.remote.lock() = Arc::downgrade(&left);
        (left, right)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn remote(&self) -> Option<Arc<MemoryConnection>> {
        self.remote.lock().upgrade()
    }

    /// Tear down both ends.
    pub fn close(&self) {
        self.close_local();
        if let Some(remote) = self.remote() {
            remote.close_local();
        }
    }

    fn close_local(&self) {
        let channels: Vec<Arc<MemoryChannel>> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending.clear();
            state.handler = None;
            state.channels.drain().map(|(_, c)| c).collect()
        };
        for channel in channels {
            channel.shut();
        }
    }

    fn deliver(&self, discovery_key: [u8; 32], message: Message) {
        let notify = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let open = state.channels.get(&discovery_key).cloned();
            if let Some(channel) = open {
                drop(state);
                channel.dispatch(message);
                return;
            }
            let queue = state.pending.entry(discovery_key).or_default();
            queue.push(message);
            trace!(connection = self.id, "buffered message for unopened channel");
            if queue.len() == 1 {
                state.handler.clone()
            } else {
                None
            }
        };
        if let Some(handler) = notify {
            self.notify_remote_open(handler, discovery_key);
        }
    }

    fn remote_opened(&self, discovery_key: [u8; 32]) {
        let handler = {
            let state = self.state.lock();
            if state.closed || state.channels.contains_key(&discovery_key) {
                return;
            }
            state.handler.clone()
        };
        if let Some(handler) = handler {
            self.notify_remote_open(handler, discovery_key);
        }
    }

    fn notify_remote_open(&self, handler: Arc<dyn PairHandler>, discovery_key: [u8; 32]) {
        if let Some(this) = self.this.upgrade() {
            handler.on_remote_open(this, discovery_key);
        }
    }

    fn remote_closed(&self, discovery_key: [u8; 32]) {
        let channel = self.state.lock().channels.remove(&discovery_key);
        if let Some(channel) = channel {
            channel.shut();
        }
    }

    fn channel_closed(&self, discovery_key: [u8; 32], channel_id: u64) {
        let removed = {
            let mut state = self.state.lock();
            match state.channels.get(&discovery_key) {
                Some(channel) if channel.id == channel_id => {
                    state.channels.remove(&discovery_key);
                    true
                }
                _ => false,
            }
        };
        if removed {
            if let Some(remote) = self.remote() {
                remote.remote_closed(discovery_key);
            }
        }
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn open_channel(
        &self,
        discovery_key: &[u8; 32],
        listener: Arc<dyn ChannelListener>,
    ) -> Option<Arc<dyn PairingChannel>> {
        let (channel, pending) = {
            let mut state = self.state.lock();
            if state.closed || state.channels.contains_key(discovery_key) {
                return None;
            }
            let channel = Arc::new_cyclic(|this| MemoryChannel {
                id: next_id(),
                discovery_key: *discovery_key,
                connection: self.this.clone(),
                listener,
                rtt: self.rtt,
                closed: AtomicBool::new(false),
                this: this.clone(),
            });
            state.channels.insert(*discovery_key, channel.clone());
            let pending = state.pending.remove(discovery_key).unwrap_or_default();
            (channel, pending)
        };

        if let Some(remote) = self.remote() {
            remote.remote_opened(*discovery_key);
        }
        for message in pending {
            channel.dispatch(message);
        }
        Some(channel)
    }

    fn pair(&self, handler: Arc<dyn PairHandler>) {
        self.state.lock().handler = Some(handler);
    }

    fn unpair(&self) {
        self.state.lock().handler = None;
    }
}

pub struct MemoryChannel {
    id: u64,
    discovery_key: [u8; 32],
    connection: Weak<MemoryConnection>,
    listener: Arc<dyn ChannelListener>,
    rtt: Duration,
    closed: AtomicBool,
    this: Weak<MemoryChannel>,
}

impl MemoryChannel {
    fn send(&self, message: Message) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let remote = self.connection.upgrade().and_then(|c| c.remote());
        if let Some(remote) = remote {
            remote.deliver(self.discovery_key, message);
        }
    }

    fn dispatch(&self, message: Message) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        match message {
            Message::Request(bytes) => self.listener.on_request(this, bytes),
            Message::Response(bytes) => self.listener.on_response(this, bytes),
        }
    }

    /// Mark closed and tell the listener, without touching the connection.
    fn shut(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listener.on_close(self.id);
    }
}

impl PairingChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn discovery_key(&self) -> [u8; 32] {
        self.discovery_key
    }

    fn send_request(&self, request: &[u8]) {
        self.send(Message::Request(request.to_vec()));
    }

    fn send_response(&self, response: &[u8]) {
        self.send(Message::Response(response.to_vec()));
    }

    fn rtt(&self) -> Duration {
        self.rtt
    }

    fn close(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.channel_closed(self.discovery_key, self.id);
        }
        self.shut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct Recorder {
        requests: Mutex<Vec<Vec<u8>>>,
        closed: Mutex<Vec<u64>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                closed: Mutex::new(Vec::new()),
            })
        }
    }

    impl ChannelListener for Recorder {
        fn on_request(&self, _channel: Arc<dyn PairingChannel>, request: Vec<u8>) {
            self.requests.lock().push(request);
        }

        fn on_response(&self, _channel: Arc<dyn PairingChannel>, _response: Vec<u8>) {}

        fn on_close(&self, channel_id: u64) {
            self.closed.lock().push(channel_id);
        }
    }

    #[tokio::test]
    async fn mutable_slots_roundtrip() {
        let dht = MemoryDht::new();
        let key_pair = KeyPair::generate();
        assert_eq!(dht.mutable_get(&key_pair.public_key()).await.unwrap(), None);
        dht.mutable_put(&key_pair, b"hello").await.unwrap();
        assert_eq!(
            dht.mutable_get(&key_pair.public_key()).await.unwrap(),
            Some(b"hello".to_vec())
        );
    }

    #[tokio::test]
    async fn lookup_returns_announced_peers() {
        let dht = MemoryDht::new();
        let topic = [9u8; 32];
        let key_pair = KeyPair::generate();
        dht.announce(&topic, &key_pair).await.unwrap();

        let mut query = dht.lookup(&topic, None);
        let reply = query.next().await.unwrap().unwrap();
        assert_eq!(reply.peers, vec![key_pair.public_key()]);
        assert!(query.next().await.is_none());
        assert!(!query.closest_nodes().is_empty());

        dht.unannounce(&topic, &key_pair).await.unwrap();
        assert!(!dht.is_announced(&topic, &key_pair.public_key()));
    }

    #[tokio::test]
    async fn offline_dht_fails() {
        let dht = MemoryDht::new();
        dht.set_offline(true);
        assert!(matches!(
            dht.mutable_get(&[0u8; 32]).await,
            Err(DhtError::Network(_))
        ));
        let mut query = dht.lookup(&[0u8; 32], None);
        assert!(query.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn held_lookup_waits_for_release() {
        let dht = MemoryDht::new();
        let topic = [9u8; 32];
        let key_pair = KeyPair::generate();
        dht.announce(&topic, &key_pair).await.unwrap();

        dht.hold_lookups();
        let mut query = dht.lookup(&topic, None);
        assert!(futures::poll!(query.next()).is_pending());
        assert_eq!(dht.lookup_count(), 1);

        dht.release_lookups();
        let reply = query.next().await.unwrap().unwrap();
        assert_eq!(reply.peers, vec![key_pair.public_key()]);

        // Released for good: new lookups run straight through.
        let mut query = dht.lookup(&topic, None);
        assert!(query.next().await.unwrap().is_ok());
        assert_eq!(dht.lookup_count(), 2);
    }

    #[test]
    fn messages_before_open_are_buffered() {
        let (left, right) = MemoryConnection::pair(Duration::from_millis(5));
        let dk = [1u8; 32];
        let sender = left.open_channel(&dk, Recorder::new()).unwrap();
        sender.send_request(b"early");

        let receiver = Recorder::new();
        right.open_channel(&dk, receiver.clone()).unwrap();
        assert_eq!(receiver.requests.lock().as_slice(), &[b"early".to_vec()]);

        assert!(right.open_channel(&dk, Recorder::new()).is_none());
    }

    #[test]
    fn close_propagates_to_remote() {
        let (left, right) = MemoryConnection::pair(Duration::from_millis(5));
        let dk = [1u8; 32];
        let local = Recorder::new();
        let remote = Recorder::new();
        let channel = left.open_channel(&dk, local.clone()).unwrap();
        let remote_channel = right.open_channel(&dk, remote.clone()).unwrap();

        channel.close();
        assert_eq!(local.closed.lock().as_slice(), &[channel.id()]);
        assert_eq!(remote.closed.lock().as_slice(), &[remote_channel.id()]);
    }
}

//! # Candidate Session
//!
//! Drives one [`CandidateRequest`] until a member answers it. Two delivery
//! paths run side by side:
//!
//! - **Broadcast.** The encoded request is written to every open channel
//!   for the discovery key, lowest round-trip time first, waiting a
//!   jittered peer interval on each before moving on.
//! - **Mailbox.** The request is published in the candidate's ephemeral
//!   DHT slot and announced under the pairing topic. Each poll reads the
//!   reply slot the member writes its answer to.
//!
//! The first valid answer wins. Acceptances and protocol-level denials
//! (rejected, used, expired) are terminal; anything else is logged and the
//! session keeps waiting.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::derive::derive_pairing_topic;
use crate::crypto::KeyPair;
use crate::error::{PairingError, Result};
use crate::pairing::{CandidateRequest, Capability, RequestEvent, ResponseOutcome};

use super::registry::RegistryInner;
use super::short;
use super::timeout::{random_interval, Timeout};
use super::transport::PairingChannel;

/// Called once with the capability of an accepted request.
#[async_trait]
pub trait PairedHandler: Send + Sync {
    async fn on_paired(&self, capability: &Capability) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct CandidateOptions {
    /// Rendezvous on this key instead of the invite's.
    pub discovery_key: Option<[u8; 32]>,
    pub handler: Option<Arc<dyn PairedHandler>>,
}

/// How a candidate session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingOutcome {
    Accepted(Capability),
    Rejected(PairingError),
    /// Closed before any answer arrived.
    Closed,
}

pub(crate) struct CandidateSession {
    registry: Weak<RegistryInner>,
    discovery_key: [u8; 32],
    topic: [u8; 32],
    request: Mutex<CandidateRequest>,
    encoded: Vec<u8>,
    ephemeral: KeyPair,
    reply: KeyPair,
    handler: Option<Arc<dyn PairedHandler>>,
    outcome: watch::Sender<Option<PairingOutcome>>,
    timeout: Timeout,
    peer_interval: Duration,
    /// Announced on the current network. Cleared by `refresh`.
    announced: AtomicBool,
    /// Announced at some point, so there is a mailbox to withdraw.
    published: AtomicBool,
    visited: Mutex<HashSet<u64>>,
    /// Wait on the channel currently being tried.
    signal: Mutex<Option<Arc<Timeout>>>,
    broadcasting: AtomicBool,
    dirty: AtomicBool,
    poll_lock: tokio::sync::Mutex<()>,
    gc: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
    run: Mutex<Option<JoinHandle<()>>>,
    this: Weak<CandidateSession>,
}

impl CandidateSession {
    pub(crate) fn new(
        registry: &Arc<RegistryInner>,
        discovery_key: [u8; 32],
        request: CandidateRequest,
        options: CandidateOptions,
    ) -> Result<Arc<Self>> {
        let encoded = request.encode()?.to_vec();
        let ephemeral = request.ephemeral_key_pair().ok_or(PairingError::RequestClosed)?;
        let reply = request.reply_key_pair().ok_or(PairingError::RequestClosed)?;

        let config = registry.config();
        let timeout = Timeout::new(random_interval(config.poll_interval));
        if registry.is_suspended() {
            timeout.suspend();
        }
        let (outcome, _) = watch::channel(None);

        Ok(Arc::new_cyclic(|this| Self {
            registry: Arc::downgrade(registry),
            topic: derive_pairing_topic(&discovery_key),
            discovery_key,
            request: Mutex::new(request),
            encoded,
            ephemeral,
            reply,
            handler: options.handler,
            outcome,
            timeout,
            peer_interval: config.peer_interval,
            announced: AtomicBool::new(false),
            published: AtomicBool::new(false),
            visited: Mutex::new(HashSet::new()),
            signal: Mutex::new(None),
            broadcasting: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            poll_lock: tokio::sync::Mutex::new(()),
            gc: Mutex::new(None),
            closing: AtomicBool::new(false),
            run: Mutex::new(None),
            this: this.clone(),
        }))
    }

    pub(crate) fn discovery_key(&self) -> &[u8; 32] {
        &self.discovery_key
    }

    fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    fn is_done(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.is_settled()
    }

    /// Start polling and broadcasting.
    pub(crate) fn start(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        *self.run.lock() = Some(tokio::spawn(this.run()));
        self.broadcast();
    }

    async fn run(self: Arc<Self>) {
        while !self.is_done() {
            let suspended = self
                .registry
                .upgrade()
                .map_or(true, |registry| registry.is_suspended());
            if !suspended {
                self.poll().await;
            }
            if self.is_done() {
                break;
            }
            self.timeout.wait().await;
        }
        self.detach();
    }

    fn detach(&self) {
        self.timeout.destroy();
        self.stop_signal();
        self.visited.lock().clear();
        if let (Some(registry), Some(this)) = (self.registry.upgrade(), self.this.upgrade()) {
            registry.detach_candidate(&self.discovery_key, &this);
        }
    }

    /// One mailbox round: read the reply slot, then publish and announce
    /// the request if that has not happened yet.
    async fn poll(&self) {
        let _guard = self.poll_lock.lock().await;
        if self.is_done() {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let dht = registry.swarm().dht();

        match dht.mutable_get(&self.reply.public_key()).await {
            Ok(Some(value)) => {
                self.add_response(value, true).await;
                if self.is_done() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(discovery_key = %short(&self.discovery_key), error = %e, "reply read failed");
                return;
            }
        }

        if self.announced.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = dht.mutable_put(&self.ephemeral, &self.encoded).await {
            debug!(error = %e, "request publish failed");
            return;
        }
        if let Err(e) = dht.announce(&self.topic, &self.ephemeral).await {
            debug!(error = %e, "pairing topic announce failed");
            return;
        }
        self.announced.store(true, Ordering::SeqCst);
        self.published.store(true, Ordering::SeqCst);
        debug!(
            discovery_key = %short(&self.discovery_key),
            mailbox = %short(&self.ephemeral.public_key()),
            "request announced"
        );

        if !self.is_done() {
            registry.set_always_server(&self.discovery_key, true);
        }
    }

    /// Feed one encoded response. `gc` forces the DHT cleanup even if this
    /// session never announced.
    pub(crate) async fn add_response(&self, value: Vec<u8>, gc: bool) {
        if self.is_done() {
            return;
        }
        let outcome = self.request.lock().handle_response(&value);

        match outcome {
            ResponseOutcome::Accepted(capability) => {
                if !self.settle(PairingOutcome::Accepted(capability.clone())) {
                    return;
                }
                info!(discovery_key = %short(&self.discovery_key), "paired");
                self.stop_signal();
                if gc || self.published.load(Ordering::SeqCst) {
                    self.spawn_gc();
                }
                if let Some(handler) = &self.handler {
                    if let Err(e) = handler.on_paired(&capability).await {
                        warn!(error = %e, "paired handler failed");
                    }
                }
                self.timeout.destroy();
            }
            ResponseOutcome::Rejected(err) if err.is_protocol_outcome() => {
                if !self.settle(PairingOutcome::Rejected(err.clone())) {
                    return;
                }
                info!(discovery_key = %short(&self.discovery_key), reason = %err, "pairing denied");
                self.stop_signal();
                if gc || self.published.load(Ordering::SeqCst) {
                    self.spawn_gc();
                }
                self.timeout.destroy();
            }
            ResponseOutcome::Rejected(err) => {
                debug!(discovery_key = %short(&self.discovery_key), error = %err, "ignoring response");
            }
        }
    }

    fn settle(&self, outcome: PairingOutcome) -> bool {
        self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }

    /// Withdraw the mailbox announcement and stop serving as a swarm
    /// server for the key.
    fn spawn_gc(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let topic = self.topic;
        let ephemeral = self.ephemeral.clone();
        let discovery_key = self.discovery_key;

        let handle = tokio::spawn(async move {
            let dht = registry.swarm().dht();
            if let Err(e) = dht.unannounce(&topic, &ephemeral).await {
                debug!(error = %e, "pairing topic unannounce failed");
            }
            if let Err(e) = registry.swarm().flush().await {
                debug!(error = %e, "swarm flush failed");
            }
            registry.set_always_server(&discovery_key, false);
        });
        *self.gc.lock() = Some(handle);
    }

    /// Try the request on the open channels. Concurrent calls coalesce
    /// into the loop already running.
    pub(crate) fn broadcast(&self) {
        if self.is_done() {
            return;
        }
        self.dirty.store(true, Ordering::SeqCst);
        if self.broadcasting.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            self.broadcasting.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(this.broadcast_loop());
    }

    async fn broadcast_loop(self: Arc<Self>) {
        loop {
            while self.dirty.swap(false, Ordering::SeqCst) && !self.is_done() {
                self.broadcast_once().await;
            }
            self.broadcasting.store(false, Ordering::SeqCst);

            // A broadcast requested between the last check and the release
            // above has to be picked up here.
            if !self.dirty.load(Ordering::SeqCst) || self.broadcasting.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn broadcast_once(&self) {
        while !self.is_done() {
            let Some(channel) = self.closest_channel() else {
                return;
            };
            self.visited.lock().insert(channel.id());
            debug!(
                discovery_key = %short(&self.discovery_key),
                channel = channel.id(),
                rtt_ms = channel.rtt().as_millis() as u64,
                "sending request"
            );
            channel.send_request(&self.encoded);

            let signal = Arc::new(Timeout::new(random_interval(self.peer_interval)));
            let suspended = self
                .registry
                .upgrade()
                .map_or(false, |registry| registry.is_suspended());
            if suspended {
                signal.suspend();
            }
            *self.signal.lock() = Some(signal.clone());
            if self.is_done() {
                signal.destroy();
            }
            signal.wait().await;
            self.signal.lock().take();
        }
    }

    fn closest_channel(&self) -> Option<Arc<dyn PairingChannel>> {
        let registry = self.registry.upgrade()?;
        let visited = self.visited.lock();
        registry
            .channels(&self.discovery_key)
            .into_iter()
            .filter(|channel| !visited.contains(&channel.id()))
            .min_by_key(|channel| channel.rtt())
    }

    pub(crate) fn forget_channel(&self, channel_id: u64) {
        self.visited.lock().remove(&channel_id);
    }

    fn stop_signal(&self) {
        if let Some(signal) = self.signal.lock().take() {
            signal.destroy();
        }
    }

    pub(crate) fn suspend(&self) {
        self.timeout.suspend();
        if let Some(signal) = self.signal.lock().as_ref() {
            signal.suspend();
        }
    }

    /// Announce again on the next poll, and run that poll now. Waits for
    /// the poll in flight before touching any state.
    pub(crate) async fn refresh(&self) {
        {
            let _guard = self.poll_lock.lock().await;
            self.announced.store(false, Ordering::SeqCst);
        }
        self.timeout.trigger();
        if let Some(signal) = self.signal.lock().as_ref() {
            signal.resume();
        }
    }

    pub(crate) async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timeout.destroy();
        self.stop_signal();

        let run = self.run.lock().take();
        if let Some(run) = run {
            if let Err(e) = run.await {
                warn!(error = %e, "candidate poll task failed");
            }
        }
        self.settle(PairingOutcome::Closed);

        if self.published.load(Ordering::SeqCst) && self.gc.lock().is_none() {
            self.spawn_gc();
        }
        let gc = self.gc.lock().take();
        if let Some(gc) = gc {
            if let Err(e) = gc.await {
                warn!(error = %e, "candidate cleanup task failed");
            }
        }
        self.detach();
        debug!(discovery_key = %short(&self.discovery_key), "candidate closed");
    }
}

/// Handle to a registered candidate.
#[derive(Clone)]
pub struct Candidate {
    session: Arc<CandidateSession>,
}

impl Candidate {
    pub(crate) fn from_session(session: Arc<CandidateSession>) -> Self {
        Self { session }
    }

    pub fn discovery_key(&self) -> &[u8; 32] {
        self.session.discovery_key()
    }

    /// Request id the member will answer under.
    pub fn request_id(&self) -> [u8; 32] {
        *self.session.request.lock().id()
    }

    pub fn is_paired(&self) -> bool {
        matches!(
            *self.session.outcome.borrow(),
            Some(PairingOutcome::Accepted(_))
        )
    }

    /// The outcome, if the session has ended.
    pub fn try_outcome(&self) -> Option<PairingOutcome> {
        self.session.outcome.borrow().clone()
    }

    /// Wait for the session to end.
    pub async fn outcome(&self) -> PairingOutcome {
        let mut outcome = self.session.outcome.subscribe();
        let settled = outcome.wait_for(Option::is_some).await;
        settled
            .ok()
            .and_then(|current| current.clone())
            .unwrap_or(PairingOutcome::Closed)
    }

    /// Lifecycle events of the underlying request.
    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.session.request.lock().subscribe()
    }

    /// Persistable form of the underlying request.
    pub fn persist(&self) -> Vec<u8> {
        self.session.request.lock().persist()
    }

    /// Poll again now.
    pub async fn refresh(&self) {
        self.session.refresh().await;
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("discovery_key", &hex::encode(self.session.discovery_key))
            .field("paired", &self.is_paired())
            .finish()
    }
}

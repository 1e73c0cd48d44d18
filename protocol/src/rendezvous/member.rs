//! # Member Session
//!
//! Serves one discovery key on behalf of an existing member. Requests reach
//! it two ways:
//!
//! 1. **Channels.** A connected candidate writes its request on the
//!    `blind-pairing` channel; the registry hands it to
//!    [`MemberSession::add_request`] and writes the answer back.
//! 2. **Mailboxes.** Every poll interval the session looks up the pairing
//!    topic on the DHT, reads each announced peer's mutable slot, and
//!    publishes the answer at the candidate's reply key pair.
//!
//! Both paths funnel through the same deduplication: one in-flight decision
//! per session token, and a bounded cache of decided sessions so a
//! candidate that keeps re-sending gets the same answer without the
//! application being asked again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::derive::{derive_pairing_topic, derive_reply_key_pair};
use crate::pairing::{MemberRequest, RequestState};

use super::registry::RegistryInner;
use super::seen::SeenCache;
use super::short;
use super::timeout::{random_interval, Timeout};
use super::transport::{DhtError, LookupQuery, NodeAddr};

/// Application hook deciding each incoming request.
///
/// The handler typically calls [`MemberRequest::open`] with the invite's
/// public key and then `confirm` or `deny`. Leaving the request undecided
/// sends nothing; the candidate will ask again.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn on_request(&self, request: &mut MemberRequest) -> anyhow::Result<()>;
}

pub struct MemberOptions {
    pub discovery_key: [u8; 32],
    /// Poll the DHT for mailbox requests. Without it the member only
    /// answers on direct channels.
    pub announce: bool,
    pub handler: Arc<dyn RequestHandler>,
}

impl MemberOptions {
    pub fn new(discovery_key: [u8; 32], handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            discovery_key,
            announce: true,
            handler,
        }
    }

    pub fn with_announce(mut self, announce: bool) -> Self {
        self.announce = announce;
        self
    }
}

/// A response ready to deliver, and the token that locates the
/// candidate's reply mailbox.
#[derive(Clone, Debug)]
pub(crate) struct Answer {
    pub(crate) response: Vec<u8>,
    pub(crate) token: [u8; 32],
}

#[derive(Clone, Debug)]
struct Decision {
    state: RequestState,
    answer: Option<Answer>,
}

impl Decision {
    fn of(request: &MemberRequest) -> Self {
        let answer = match (request.response(), request.token()) {
            (Some(response), Some(token)) => Some(Answer {
                response: response.to_vec(),
                token: *token,
            }),
            _ => None,
        };
        Self {
            state: request.state(),
            answer,
        }
    }

    fn is_final(&self) -> bool {
        matches!(self.state, RequestState::Confirmed | RequestState::Denied)
    }
}

type PendingDecision = Shared<BoxFuture<'static, Decision>>;

pub(crate) struct MemberSession {
    registry: Weak<RegistryInner>,
    discovery_key: [u8; 32],
    topic: [u8; 32],
    handler: Arc<dyn RequestHandler>,
    timeout: Timeout,
    skip: Mutex<SeenCache<[u8; 32]>>,
    pending: Mutex<HashMap<[u8; 32], PendingDecision>>,
    decided: Mutex<SeenCache<[u8; 32], Decision>>,
    closest_nodes: Mutex<Option<Vec<NodeAddr>>>,
    abort: watch::Sender<u64>,
    poll_lock: tokio::sync::Mutex<()>,
    announced: AtomicBool,
    closing: AtomicBool,
    run: Mutex<Option<JoinHandle<()>>>,
    this: Weak<MemberSession>,
}

impl MemberSession {
    pub(crate) fn new(registry: &Arc<RegistryInner>, options: MemberOptions) -> Arc<Self> {
        let config = registry.config();
        let timeout = Timeout::new(random_interval(config.poll_interval));
        if registry.is_suspended() {
            timeout.suspend();
        }
        let (abort, _) = watch::channel(0);

        Arc::new_cyclic(|this| Self {
            registry: Arc::downgrade(registry),
            topic: derive_pairing_topic(&options.discovery_key),
            discovery_key: options.discovery_key,
            handler: options.handler,
            timeout,
            skip: Mutex::new(SeenCache::new(config.seen_cache_size)),
            pending: Mutex::new(HashMap::new()),
            decided: Mutex::new(SeenCache::new(config.decided_cache_size)),
            closest_nodes: Mutex::new(None),
            abort,
            poll_lock: tokio::sync::Mutex::new(()),
            announced: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            run: Mutex::new(None),
            this: this.clone(),
        })
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Start the mailbox poll loop. Idempotent.
    pub(crate) fn announce(&self) {
        if self.is_closing() || self.announced.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if let Some(registry) = self.registry.upgrade() {
            registry.update_swarm(&self.discovery_key);
        }
        debug!(discovery_key = %short(&self.discovery_key), "member announcing");
        *self.run.lock() = Some(tokio::spawn(this.run()));
    }

    async fn run(self: Arc<Self>) {
        while !self.is_closing() {
            let suspended = self
                .registry
                .upgrade()
                .map_or(true, |registry| registry.is_suspended());
            if !suspended {
                self.poll().await;
            }
            if self.is_closing() {
                break;
            }
            self.timeout.wait().await;
        }
    }

    /// Decide one encoded request. Returns the response to deliver, if the
    /// decision produced one.
    pub(crate) async fn add_request(&self, bytes: &[u8]) -> Option<Answer> {
        let mut request = match MemberRequest::from_bytes(bytes) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "dropping malformed request");
                return None;
            }
        };
        request.discovery_key = Some(self.discovery_key);
        let session = *request.session();

        // Both caches are consulted and updated under the pending lock, so a
        // duplicate either joins the decision in flight or finds it decided.
        let shared = {
            let mut pending = self.pending.lock();
            if let Some(decision) = self.decided.lock().get(&session) {
                return decision.answer.clone();
            }
            pending
                .entry(session)
                .or_insert_with(|| {
                    let handler = self.handler.clone();
                    async move {
                        let mut request = request;
                        if let Err(e) = handler.on_request(&mut request).await {
                            warn!(error = %e, "request handler failed");
                        }
                        Decision::of(&request)
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };

        let decision = shared.clone().await;

        let settled = {
            let mut pending = self.pending.lock();
            let ours = pending
                .get(&session)
                .map_or(false, |current| current.ptr_eq(&shared));
            if ours {
                if decision.is_final() {
                    self.decided.lock().insert(session, decision.clone());
                }
                pending.remove(&session);
            }
            ours && decision.is_final()
        };

        if settled {
            info!(
                discovery_key = %short(&self.discovery_key),
                session = %short(&session),
                state = ?decision.state,
                "request decided"
            );
        }
        decision.answer
    }

    async fn poll(&self) {
        let _guard = self.poll_lock.lock().await;
        if self.is_closing() {
            return;
        }
        let mut abort = self.abort.subscribe();

        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let dht = registry.swarm().dht();
        drop(registry);

        let hint = self.closest_nodes.lock().clone();
        let mut query = dht.lookup(&self.topic, hint);

        let aborted = tokio::select! {
            _ = abort.changed() => true,
            _ = self.drain(&mut query) => false,
        };
        if aborted {
            debug!(discovery_key = %short(&self.discovery_key), "member poll aborted");
            return;
        }

        let nodes = query.closest_nodes();
        if !nodes.is_empty() {
            *self.closest_nodes.lock() = Some(nodes);
        }
    }

    async fn drain(&self, query: &mut Box<dyn LookupQuery>) {
        let mut visited = HashSet::new();
        while let Some(reply) = query.next().await {
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(error = %e, "pairing topic lookup failed");
                    return;
                }
            };
            for peer in reply.peers {
                if !visited.insert(peer) {
                    continue;
                }
                self.add_peer(peer).await;
            }
        }
    }

    /// Read one announced mailbox and answer it. A mailbox is skipped on
    /// later polls only once it has been read.
    async fn add_peer(&self, peer: [u8; 32]) {
        if self.skip.lock().contains(&peer) {
            return;
        }

        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let dht = registry.swarm().dht();

        let value = match dht.mutable_get(&peer).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!(peer = %short(&peer), "mailbox announced but empty");
                return;
            }
            Err(e) => {
                debug!(peer = %short(&peer), error = %e, "mailbox read failed");
                return;
            }
        };
        self.skip.lock().mark(peer);

        let Some(answer) = self.add_request(&value).await else {
            return;
        };

        let reply = derive_reply_key_pair(&answer.token);
        if let Err(e) = dht.mutable_put(&reply, &answer.response).await {
            debug!(peer = %short(&peer), error = %e, "mailbox reply failed");
            return;
        }
        debug!(peer = %short(&peer), "mailbox reply published");

        if registry.always_client(&self.discovery_key) {
            return;
        }
        registry.set_always_client(&self.discovery_key, true);
        let discovery_key = self.discovery_key;
        tokio::spawn(async move {
            if let Err(e) = registry.swarm().flush().await {
                debug!(error = %e, "swarm flush failed");
            }
            registry.set_always_client(&discovery_key, false);
        });
    }

    /// Cancel the poll in flight and wait for it to stop.
    async fn abort(&self) {
        self.abort.send_modify(|generation| *generation += 1);
        let _ = self.poll_lock.lock().await;
    }

    pub(crate) async fn suspend(&self) {
        self.timeout.suspend();
        self.abort().await;
    }

    pub(crate) async fn refresh(&self) {
        self.abort().await;
        self.timeout.trigger();
    }

    pub(crate) async fn flushed(&self) -> Result<(), DhtError> {
        let discovery = self
            .registry
            .upgrade()
            .and_then(|registry| registry.discovery(&self.discovery_key));
        match discovery {
            Some(discovery) => discovery.flushed().await,
            None => Ok(()),
        }
    }

    pub(crate) async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timeout.destroy();
        self.abort().await;

        let run = self.run.lock().take();
        if let Some(run) = run {
            if let Err(e) = run.await {
                warn!(error = %e, "member poll task failed");
            }
        }

        if let (Some(registry), Some(this)) = (self.registry.upgrade(), self.this.upgrade()) {
            registry.detach_member(&self.discovery_key, &this);
        }
        debug!(discovery_key = %short(&self.discovery_key), "member closed");
    }
}

/// Handle to a registered member.
#[derive(Clone)]
pub struct Member {
    session: Arc<MemberSession>,
}

impl Member {
    pub(crate) fn from_session(session: Arc<MemberSession>) -> Self {
        Self { session }
    }

    pub fn discovery_key(&self) -> &[u8; 32] {
        &self.session.discovery_key
    }

    /// DHT topic polled for mailbox requests.
    pub fn pairing_topic(&self) -> &[u8; 32] {
        &self.session.topic
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closing()
    }

    /// Start polling mailboxes, for a member added with `announce: false`.
    pub fn announce(&self) {
        self.session.announce();
    }

    /// Resolves once the member's swarm join has been announced.
    pub async fn flushed(&self) -> Result<(), DhtError> {
        self.session.flushed().await
    }

    /// Poll again now.
    pub async fn refresh(&self) {
        self.session.refresh().await;
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("discovery_key", &hex::encode(self.session.discovery_key))
            .field("closed", &self.is_closed())
            .finish()
    }
}

//! # Pairing Registry
//!
//! One entry per discovery key, uniting at most one [`Member`] and at most
//! one [`Candidate`] with the channels open for that key on every swarm
//! connection.
//!
//! ## Swarm participation
//!
//! On every state change the registry recomputes how the key should be
//! joined on the swarm:
//!
//! ```text
//! server = always_server || has member
//! client = always_client || has candidate
//! ```
//!
//! and re-joins only if those flags changed. `always_server` is forced by a
//! candidate that announced itself on the DHT; `always_client` by a member
//! that just published a mailbox reply and wants to connect to the
//! candidate until the reply has propagated.
//!
//! ## Lifetime
//!
//! An entry is removed as soon as its member and candidate are both gone.
//! Entries created because a remote peer opened a channel for a key we had
//! no session for are idle from birth; [`BlindPairing::compact`] sweeps
//! those once they have been idle longer than the configured timeout.
//!
//! All entry mutation happens under a single mutex that is never held
//! across an await or a call into a session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::PairingConfig;
use crate::error::{PairingError, Result};
use crate::pairing::CandidateRequest;

use super::candidate::{Candidate, CandidateOptions, CandidateSession};
use super::member::{Member, MemberOptions, MemberSession};
use super::short;
use super::transport::{
    ChannelListener, Connection, Discovery, JoinOptions, PairHandler, PairingChannel, Swarm,
};

struct Entry {
    member: Option<Arc<MemberSession>>,
    candidate: Option<Arc<CandidateSession>>,
    channels: HashMap<u64, Arc<dyn PairingChannel>>,
    always_server: bool,
    always_client: bool,
    discovery: Option<Arc<dyn Discovery>>,
    /// Set while the entry has neither member nor candidate.
    idle_since: Option<Instant>,
}

impl Entry {
    fn new() -> Self {
        Self {
            member: None,
            candidate: None,
            channels: HashMap::new(),
            always_server: false,
            always_client: false,
            discovery: None,
            idle_since: Some(Instant::now()),
        }
    }

    fn is_idle(&self) -> bool {
        self.member.is_none() && self.candidate.is_none()
    }
}

pub(crate) struct RegistryInner {
    swarm: Arc<dyn Swarm>,
    config: PairingConfig,
    entries: Mutex<HashMap<[u8; 32], Entry>>,
    suspended: AtomicBool,
    closing: AtomicBool,
    refreshing: tokio::sync::Mutex<()>,
    this: Weak<RegistryInner>,
}

/// The blind pairing orchestrator for one swarm.
#[derive(Clone)]
pub struct BlindPairing {
    inner: Arc<RegistryInner>,
}

impl BlindPairing {
    pub fn new(swarm: Arc<dyn Swarm>, config: PairingConfig) -> Self {
        let inner = Arc::new_cyclic(|this| RegistryInner {
            swarm,
            config,
            entries: Mutex::new(HashMap::new()),
            suspended: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            refreshing: tokio::sync::Mutex::new(()),
            this: this.clone(),
        });
        Self { inner }
    }

    pub fn config(&self) -> &PairingConfig {
        &self.inner.config
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.is_suspended()
    }

    /// Discovery keys with a registry entry.
    pub fn active_keys(&self) -> Vec<[u8; 32]> {
        self.inner.entries.lock().keys().copied().collect()
    }

    /// Register the member for a discovery key.
    pub fn add_member(&self, options: MemberOptions) -> Result<Member> {
        let discovery_key = options.discovery_key;
        let announce = options.announce;
        let session = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(discovery_key).or_insert_with(Entry::new);
            if entry.member.is_some() {
                return Err(PairingError::MemberExists(hex::encode(discovery_key)));
            }
            let session = MemberSession::new(&self.inner, options);
            entry.member = Some(session.clone());
            entry.idle_since = None;
            session
        };

        info!(discovery_key = %short(&discovery_key), announce, "member added");
        if announce {
            session.announce();
        } else {
            self.inner.attach_to_swarm(&discovery_key);
        }
        Ok(Member::from_session(session))
    }

    /// Register a candidate for the request's discovery key, or for
    /// `options.discovery_key` when set.
    pub fn add_candidate(
        &self,
        request: CandidateRequest,
        options: CandidateOptions,
    ) -> Result<Candidate> {
        if request.is_completed() {
            return Err(PairingError::RequestClosed);
        }
        let discovery_key = options
            .discovery_key
            .unwrap_or_else(|| *request.discovery_key());

        let session = CandidateSession::new(&self.inner, discovery_key, request, options)?;
        {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(discovery_key).or_insert_with(Entry::new);
            if entry.candidate.is_some() {
                return Err(PairingError::CandidateExists(hex::encode(discovery_key)));
            }
            entry.candidate = Some(session.clone());
            entry.idle_since = None;
        }

        info!(discovery_key = %short(&discovery_key), "candidate added");
        self.inner.update_swarm(&discovery_key);
        session.start();
        Ok(Candidate::from_session(session))
    }

    /// Hook a new swarm connection into every active entry.
    pub fn on_connection(&self, connection: Arc<dyn Connection>) {
        connection.pair(Arc::new(RemoteOpen {
            registry: self.inner.this.clone(),
        }));
        for discovery_key in self.active_keys() {
            self.inner.attach_to_connection(&connection, &discovery_key);
        }
    }

    /// Pause every session without tearing down state.
    pub async fn suspend(&self) {
        if self.inner.suspended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("pairing suspended");
        let (members, candidates) = self.inner.sessions();
        for candidate in &candidates {
            candidate.suspend();
        }
        futures::future::join_all(members.iter().map(|m| m.suspend())).await;
    }

    pub fn resume(&self) {
        if !self.inner.suspended.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("pairing resumed");
        let this = self.clone();
        tokio::spawn(async move { this.refresh().await });
    }

    /// Restart every session's poll now, e.g. after a network change.
    ///
    /// Concurrent callers wait for the refresh already in flight.
    pub async fn refresh(&self) {
        let _guard = match self.inner.refreshing.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let _ = self.inner.refreshing.lock().await;
                return;
            }
        };
        if self.inner.is_closing() || self.inner.is_suspended() {
            return;
        }
        debug!("refreshing pairing sessions");
        let (members, candidates) = self.inner.sessions();
        let members = members.iter().map(|m| m.refresh());
        let candidates = candidates.iter().map(|c| c.refresh());
        futures::future::join(
            futures::future::join_all(members),
            futures::future::join_all(candidates),
        )
        .await;
    }

    /// Drop entries that have been idle longer than the idle timeout.
    /// Returns how many were removed.
    pub fn compact(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let removed: Vec<([u8; 32], Entry)> = {
            let mut entries = self.inner.entries.lock();
            let expired: Vec<[u8; 32]> = entries
                .iter()
                .filter(|(_, e)| {
                    e.is_idle()
                        && e.idle_since.map_or(false, |since| since.elapsed() >= idle_timeout)
                })
                .map(|(k, _)| *k)
                .collect();
            expired
                .into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                .collect()
        };

        for (discovery_key, entry) in &removed {
            debug!(discovery_key = %short(discovery_key), "compacting idle entry");
            self.inner.teardown(entry);
        }
        removed.len()
    }

    /// Close every session and leave every swarm join.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing pairing registry");
        for connection in self.inner.swarm.connections() {
            connection.unpair();
        }

        let (members, candidates) = self.inner.sessions();
        let members = members.iter().map(|m| m.close());
        let candidates = candidates.iter().map(|c| c.close());
        futures::future::join(
            futures::future::join_all(members),
            futures::future::join_all(candidates),
        )
        .await;

        let remaining: Vec<Entry> = self.inner.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in &remaining {
            self.inner.teardown(entry);
        }
    }
}

impl RegistryInner {
    pub(crate) fn config(&self) -> &PairingConfig {
        &self.config
    }

    pub(crate) fn swarm(&self) -> &Arc<dyn Swarm> {
        &self.swarm
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn sessions(&self) -> (Vec<Arc<MemberSession>>, Vec<Arc<CandidateSession>>) {
        let entries = self.entries.lock();
        let members = entries.values().filter_map(|e| e.member.clone()).collect();
        let candidates = entries.values().filter_map(|e| e.candidate.clone()).collect();
        (members, candidates)
    }

    pub(crate) fn discovery(&self, discovery_key: &[u8; 32]) -> Option<Arc<dyn Discovery>> {
        self.entries
            .lock()
            .get(discovery_key)
            .and_then(|e| e.discovery.clone())
    }

    pub(crate) fn channels(&self, discovery_key: &[u8; 32]) -> Vec<Arc<dyn PairingChannel>> {
        self.entries
            .lock()
            .get(discovery_key)
            .map(|e| e.channels.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn set_always_client(&self, discovery_key: &[u8; 32], value: bool) {
        if let Some(entry) = self.entries.lock().get_mut(discovery_key) {
            entry.always_client = value;
        }
        self.update_swarm(discovery_key);
    }

    pub(crate) fn always_client(&self, discovery_key: &[u8; 32]) -> bool {
        self.entries
            .lock()
            .get(discovery_key)
            .map_or(false, |e| e.always_client)
    }

    pub(crate) fn set_always_server(&self, discovery_key: &[u8; 32], value: bool) {
        if let Some(entry) = self.entries.lock().get_mut(discovery_key) {
            entry.always_server = value;
        }
        self.update_swarm(discovery_key);
    }

    /// Re-join the swarm for `discovery_key` if the server/client flags
    /// changed.
    pub(crate) fn update_swarm(&self, discovery_key: &[u8; 32]) {
        let (previous, joined) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(discovery_key) else {
                return;
            };
            let server = entry.always_server || entry.member.is_some();
            let client = entry.always_client || entry.candidate.is_some();

            if let Some(discovery) = &entry.discovery {
                if discovery.is_server() == server && discovery.is_client() == client {
                    return;
                }
            }

            let previous = entry.discovery.take();
            if server || client {
                debug!(discovery_key = %short(discovery_key), server, client, "joining swarm");
                entry.discovery = Some(self.swarm.join(discovery_key, JoinOptions { server, client }));
            }
            (previous, entry.discovery.is_some())
        };

        if let Some(previous) = previous {
            destroy_in_background(previous);
        }
        if joined {
            self.attach_to_swarm(discovery_key);
        }
    }

    /// Open the channel for `discovery_key` on every swarm connection.
    pub(crate) fn attach_to_swarm(&self, discovery_key: &[u8; 32]) {
        for connection in self.swarm.connections() {
            self.attach_to_connection(&connection, discovery_key);
        }
    }

    fn attach_to_connection(&self, connection: &Arc<dyn Connection>, discovery_key: &[u8; 32]) {
        let listener = Arc::new(ChannelRouter {
            registry: self.this.clone(),
            discovery_key: *discovery_key,
        });
        let Some(channel) = connection.open_channel(discovery_key, listener) else {
            return;
        };

        let candidate = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(*discovery_key).or_insert_with(Entry::new);
            entry.channels.insert(channel.id(), channel);
            entry.candidate.clone()
        };
        debug!(discovery_key = %short(discovery_key), connection = connection.id(), "channel attached");

        if let Some(candidate) = candidate {
            candidate.broadcast();
        }
    }

    pub(crate) fn detach_member(&self, discovery_key: &[u8; 32], session: &Arc<MemberSession>) {
        {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(discovery_key) else {
                return;
            };
            if !entry.member.as_ref().map_or(false, |m| Arc::ptr_eq(m, session)) {
                return;
            }
            entry.member = None;
        }
        self.gc(discovery_key);
    }

    pub(crate) fn detach_candidate(&self, discovery_key: &[u8; 32], session: &Arc<CandidateSession>) {
        {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(discovery_key) else {
                return;
            };
            if !entry.candidate.as_ref().map_or(false, |c| Arc::ptr_eq(c, session)) {
                return;
            }
            entry.candidate = None;
        }
        self.gc(discovery_key);
    }

    /// Remove the entry if nothing uses it any more, otherwise make sure
    /// its swarm join still matches. Returns whether it was removed.
    fn gc(&self, discovery_key: &[u8; 32]) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            let idle = match entries.get(discovery_key) {
                Some(entry) => entry.is_idle(),
                None => return false,
            };
            if idle {
                entries.remove(discovery_key)
            } else {
                None
            }
        };

        match removed {
            Some(entry) => {
                debug!(discovery_key = %short(discovery_key), "entry removed");
                self.teardown(&entry);
                true
            }
            None => {
                self.update_swarm(discovery_key);
                false
            }
        }
    }

    fn teardown(&self, entry: &Entry) {
        for channel in entry.channels.values() {
            channel.close();
        }
        if let Some(discovery) = entry.discovery.clone() {
            destroy_in_background(discovery);
        }
    }

    fn remove_channel(&self, discovery_key: &[u8; 32], channel_id: u64) {
        let candidate = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(discovery_key) else {
                return;
            };
            entry.channels.remove(&channel_id);
            entry.candidate.clone()
        };
        if let Some(candidate) = candidate {
            candidate.forget_channel(channel_id);
        }
    }

    fn member(&self, discovery_key: &[u8; 32]) -> Option<Arc<MemberSession>> {
        self.entries.lock().get(discovery_key).and_then(|e| e.member.clone())
    }

    fn candidate(&self, discovery_key: &[u8; 32]) -> Option<Arc<CandidateSession>> {
        self.entries
            .lock()
            .get(discovery_key)
            .and_then(|e| e.candidate.clone())
    }
}

fn destroy_in_background(discovery: Arc<dyn Discovery>) {
    tokio::spawn(async move {
        if let Err(e) = discovery.destroy().await {
            debug!(error = %e, "failed to leave swarm topic");
        }
    });
}

/// Routes one channel's messages to the entry's sessions.
struct ChannelRouter {
    registry: Weak<RegistryInner>,
    discovery_key: [u8; 32],
}

impl ChannelListener for ChannelRouter {
    fn on_request(&self, channel: Arc<dyn PairingChannel>, request: Vec<u8>) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let Some(member) = registry.member(&self.discovery_key) else {
            return;
        };
        tokio::spawn(async move {
            if let Some(answer) = member.add_request(&request).await {
                channel.send_response(&answer.response);
            }
        });
    }

    fn on_response(&self, _channel: Arc<dyn PairingChannel>, response: Vec<u8>) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let Some(candidate) = registry.candidate(&self.discovery_key) else {
            return;
        };
        tokio::spawn(async move {
            candidate.add_response(response, false).await;
        });
    }

    fn on_close(&self, channel_id: u64) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_channel(&self.discovery_key, channel_id);
        }
    }
}

/// Attaches channels the remote side opens for keys we have no entry for.
struct RemoteOpen {
    registry: Weak<RegistryInner>,
}

impl PairHandler for RemoteOpen {
    fn on_remote_open(&self, connection: Arc<dyn Connection>, discovery_key: [u8; 32]) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if registry.is_closing() {
            return;
        }
        registry.attach_to_connection(&connection, &discovery_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDht, MemorySwarm};
    use crate::pairing::{create_invite, InviteOptions};
    use crate::rendezvous::member::RequestHandler;
    use crate::pairing::MemberRequest;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Ignore;

    #[async_trait]
    impl RequestHandler for Ignore {
        async fn on_request(&self, _request: &mut MemberRequest) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> (BlindPairing, Arc<MemorySwarm>) {
        let swarm = Arc::new(MemorySwarm::new(Arc::new(MemoryDht::new())));
        let config = PairingConfig::default().with_idle_timeout(Duration::from_secs(5));
        (BlindPairing::new(swarm.clone(), config), swarm)
    }

    #[tokio::test]
    async fn second_member_for_same_key_conflicts() {
        let (pairing, _) = registry();
        let dk = [1u8; 32];
        let member = pairing
            .add_member(MemberOptions::new(dk, Arc::new(Ignore)).with_announce(false))
            .unwrap();
        let err = pairing
            .add_member(MemberOptions::new(dk, Arc::new(Ignore)))
            .err()
            .unwrap();
        assert!(matches!(err, PairingError::MemberExists(_)));

        member.close().await;
        assert!(pairing.active_keys().is_empty());
        pairing
            .add_member(MemberOptions::new(dk, Arc::new(Ignore)).with_announce(false))
            .unwrap();
    }

    #[tokio::test]
    async fn second_candidate_for_same_key_conflicts() {
        let (pairing, _) = registry();
        let created = create_invite(&[7u8; 32], InviteOptions::default());
        let first = CandidateRequest::from_invite_bytes(&created.invite, b"a").unwrap();
        let second = CandidateRequest::from_invite_bytes(&created.invite, b"b").unwrap();

        let candidate = pairing.add_candidate(first, CandidateOptions::default()).unwrap();
        let err = pairing
            .add_candidate(second, CandidateOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, PairingError::CandidateExists(_)));
        candidate.close().await;
    }

    #[tokio::test]
    async fn swarm_flags_follow_sessions() {
        let (pairing, swarm) = registry();
        let created = create_invite(&[7u8; 32], InviteOptions::default());
        let dk = created.discovery_key;

        let member = pairing
            .add_member(MemberOptions::new(dk, Arc::new(Ignore)))
            .unwrap();
        assert_eq!(
            swarm.last_join(&dk),
            Some(JoinOptions { server: true, client: false })
        );

        let request = CandidateRequest::from_invite_bytes(&created.invite, b"alice").unwrap();
        let candidate = pairing.add_candidate(request, CandidateOptions::default()).unwrap();
        assert_eq!(
            swarm.last_join(&dk),
            Some(JoinOptions { server: true, client: true })
        );
        let joins = swarm.join_count(&dk);

        // Same flags: no re-join.
        pairing.inner.update_swarm(&dk);
        assert_eq!(swarm.join_count(&dk), joins);

        candidate.close().await;
        member.close().await;
        assert!(pairing.active_keys().is_empty());
        pairing.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn compact_sweeps_idle_entries() {
        let (pairing, _) = registry();
        let dk = [3u8; 32];
        pairing.inner.entries.lock().insert(dk, Entry::new());

        assert_eq!(pairing.compact(), 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(pairing.compact(), 1);
        assert!(pairing.active_keys().is_empty());
    }

    #[tokio::test]
    async fn suspend_and_resume_toggle_flag() {
        let (pairing, _) = registry();
        pairing.suspend().await;
        assert!(pairing.is_suspended());
        pairing.refresh().await;
        pairing.resume();
        assert!(!pairing.is_suspended());
    }
}

//! End-to-end pairing tests.
//!
//! Each test builds two registries, one per peer, over the in-memory DHT and
//! swarm and runs a complete pairing through the public API. Time is paused
//! so poll intervals of minutes elapse instantly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use blind_pairing::crypto::derive::derive_pairing_topic;
use blind_pairing::memory::{MemoryDht, MemorySwarm};
use blind_pairing::pairing::{
    create_invite, decode_invite, verify_receipt, CandidateRequest, Capability, Confirmation,
    CreatedInvite, DenyStatus, InviteOptions, MemberRequest,
};
use blind_pairing::rendezvous::{
    BlindPairing, CandidateOptions, MemberOptions, PairedHandler, PairingOutcome, RequestHandler,
};
use blind_pairing::{PairingConfig, PairingError};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const RESOURCE_KEY: [u8; 32] = [42u8; 32];
const DEADLINE: Duration = Duration::from_secs(3600);

#[derive(Clone, Copy)]
enum Verdict {
    Confirm,
    Deny(DenyStatus),
    /// Open with a key that is not the invite's.
    WrongKey,
}

struct Approver {
    invite: CreatedInvite,
    verdict: Verdict,
    calls: AtomicUsize,
    receipts: parking_lot::Mutex<Vec<Vec<u8>>>,
}

impl Approver {
    fn new(invite: &CreatedInvite, verdict: Verdict) -> Arc<Self> {
        Arc::new(Self {
            invite: invite.clone(),
            verdict,
            calls: AtomicUsize::new(0),
            receipts: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestHandler for Approver {
    async fn on_request(&self, request: &mut MemberRequest) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(request.invite_id(), &self.invite.id);

        let public_key = match self.verdict {
            Verdict::WrongKey => [0u8; 32],
            _ => self.invite.public_key,
        };
        request.open(&public_key)?;
        if let Some(receipt) = request.receipt() {
            self.receipts.lock().push(receipt.to_vec());
        }

        match self.verdict {
            Verdict::Confirm => request.confirm(Confirmation {
                key: RESOURCE_KEY,
                encryption_key: Some([9u8; 32]),
                additional: self.invite.additional.clone(),
            })?,
            Verdict::Deny(status) => request.deny(status)?,
            Verdict::WrongKey => {}
        }
        Ok(())
    }
}

struct Peer {
    dht: Arc<MemoryDht>,
    swarm: Arc<MemorySwarm>,
    pairing: BlindPairing,
}

fn peers() -> (Peer, Peer) {
    let dht = Arc::new(MemoryDht::new());
    let config = PairingConfig::default().with_poll_interval(Duration::from_secs(1));
    let make = || {
        let swarm = Arc::new(MemorySwarm::new(dht.clone()));
        Peer {
            dht: dht.clone(),
            pairing: BlindPairing::new(swarm.clone(), config.clone()),
            swarm,
        }
    };
    (make(), make())
}

fn connect(a: &Peer, b: &Peer) {
    let (left, right) = MemorySwarm::connect(&a.swarm, &b.swarm, Duration::from_millis(20));
    a.pairing.on_connection(left);
    b.pairing.on_connection(right);
}

fn invite(options: InviteOptions) -> CreatedInvite {
    create_invite(&RESOURCE_KEY, options)
}

async fn outcome(candidate: &blind_pairing::Candidate) -> PairingOutcome {
    tokio::time::timeout(DEADLINE, candidate.outcome())
        .await
        .expect("pairing did not finish")
}

// ---------------------------------------------------------------------------
// Pairing paths
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pairs_over_direct_channel() {
    let (member_peer, candidate_peer) = peers();
    let created = invite(InviteOptions::default());
    let approver = Approver::new(&created, Verdict::Confirm);

    // Members that do not announce only answer on channels.
    let member = member_peer
        .pairing
        .add_member(
            MemberOptions::new(created.discovery_key, approver.clone()).with_announce(false),
        )
        .unwrap();
    connect(&member_peer, &candidate_peer);

    let request = CandidateRequest::from_invite_bytes(&created.invite, b"laptop").unwrap();
    let candidate = candidate_peer
        .pairing
        .add_candidate(request, CandidateOptions::default())
        .unwrap();

    match outcome(&candidate).await {
        PairingOutcome::Accepted(capability) => {
            assert_eq!(capability.key, RESOURCE_KEY);
            assert_eq!(capability.encryption_key, Some([9u8; 32]));
            assert_eq!(capability.data, None);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(approver.calls(), 1);

    candidate.close().await;
    member.close().await;
    member_peer.pairing.close().await;
    candidate_peer.pairing.close().await;
}

#[tokio::test(start_paused = true)]
async fn pairs_through_dht_mailbox() {
    let (member_peer, candidate_peer) = peers();
    let created = invite(InviteOptions::default());
    let approver = Approver::new(&created, Verdict::Confirm);

    member_peer
        .pairing
        .add_member(MemberOptions::new(created.discovery_key, approver.clone()))
        .unwrap();

    let request = CandidateRequest::from_invite_bytes(&created.invite, b"phone").unwrap();
    let mailbox = request.ephemeral_key_pair().unwrap().public_key();
    let candidate = candidate_peer
        .pairing
        .add_candidate(request, CandidateOptions::default())
        .unwrap();

    assert!(matches!(outcome(&candidate).await, PairingOutcome::Accepted(_)));
    candidate.close().await;

    // The mailbox announcement is withdrawn once paired.
    let topic = derive_pairing_topic(&created.discovery_key);
    assert!(!candidate_peer.dht.is_announced(&topic, &mailbox));
    assert_eq!(approver.calls(), 1);

    member_peer.pairing.close().await;
    candidate_peer.pairing.close().await;
}

#[tokio::test(start_paused = true)]
async fn both_paths_decide_once() {
    let (member_peer, candidate_peer) = peers();
    let created = invite(InviteOptions::default());
    let approver = Approver::new(&created, Verdict::Confirm);

    member_peer
        .pairing
        .add_member(MemberOptions::new(created.discovery_key, approver.clone()))
        .unwrap();
    connect(&member_peer, &candidate_peer);

    let request = CandidateRequest::from_invite_bytes(&created.invite, b"tablet").unwrap();
    let candidate = candidate_peer
        .pairing
        .add_candidate(request, CandidateOptions::default())
        .unwrap();
    assert!(matches!(outcome(&candidate).await, PairingOutcome::Accepted(_)));

    // Let the member keep polling for a while.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(approver.calls(), 1);

    member_peer.pairing.close().await;
    candidate_peer.pairing.close().await;
}

// ---------------------------------------------------------------------------
// Denials and failures
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn used_invite_is_reported() {
    let (member_peer, candidate_peer) = peers();
    let created = invite(InviteOptions::default());
    let approver = Approver::new(&created, Verdict::Deny(DenyStatus::Used));

    member_peer
        .pairing
        .add_member(MemberOptions::new(created.discovery_key, approver))
        .unwrap();
    connect(&member_peer, &candidate_peer);

    let request = CandidateRequest::from_invite_bytes(&created.invite, b"laptop").unwrap();
    let candidate = candidate_peer
        .pairing
        .add_candidate(request, CandidateOptions::default())
        .unwrap();

    assert_eq!(
        outcome(&candidate).await,
        PairingOutcome::Rejected(PairingError::InviteUsed)
    );
    assert!(!candidate.is_paired());

    member_peer.pairing.close().await;
    candidate_peer.pairing.close().await;
}

#[tokio::test(start_paused = true)]
async fn expired_invite_is_denied() {
    let (member_peer, candidate_peer) = peers();
    let created = invite(InviteOptions {
        expires: Some(1),
        ..InviteOptions::default()
    });
    assert!(decode_invite(&created.invite).unwrap().is_expired());

    let approver = Approver::new(&created, Verdict::Deny(DenyStatus::Expired));
    member_peer
        .pairing
        .add_member(MemberOptions::new(created.discovery_key, approver))
        .unwrap();

    let request = CandidateRequest::from_invite_bytes(&created.invite, b"laptop").unwrap();
    let candidate = candidate_peer
        .pairing
        .add_candidate(request, CandidateOptions::default())
        .unwrap();

    assert_eq!(
        outcome(&candidate).await,
        PairingOutcome::Rejected(PairingError::InviteExpired)
    );

    member_peer.pairing.close().await;
    candidate_peer.pairing.close().await;
}

#[tokio::test(start_paused = true)]
async fn undecided_request_keeps_candidate_waiting() {
    let (member_peer, candidate_peer) = peers();
    let created = invite(InviteOptions::default());
    let approver = Approver::new(&created, Verdict::WrongKey);

    member_peer
        .pairing
        .add_member(MemberOptions::new(created.discovery_key, approver.clone()))
        .unwrap();
    connect(&member_peer, &candidate_peer);

    let request = CandidateRequest::from_invite_bytes(&created.invite, b"laptop").unwrap();
    let candidate = candidate_peer
        .pairing
        .add_candidate(request, CandidateOptions::default())
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(candidate.try_outcome().is_none());
    assert!(approver.calls() >= 1);

    candidate.close().await;
    assert_eq!(candidate.outcome().await, PairingOutcome::Closed);

    member_peer.pairing.close().await;
    candidate_peer.pairing.close().await;
}

#[tokio::test(start_paused = true)]
async fn offline_dht_does_not_block_channel_path() {
    let (member_peer, candidate_peer) = peers();
    member_peer.dht.set_offline(true);

    let created = invite(InviteOptions::default());
    let approver = Approver::new(&created, Verdict::Confirm);
    member_peer
        .pairing
        .add_member(MemberOptions::new(created.discovery_key, approver))
        .unwrap();
    connect(&member_peer, &candidate_peer);

    let request = CandidateRequest::from_invite_bytes(&created.invite, b"laptop").unwrap();
    let candidate = candidate_peer
        .pairing
        .add_candidate(request, CandidateOptions::default())
        .unwrap();

    assert!(matches!(outcome(&candidate).await, PairingOutcome::Accepted(_)));

    member_peer.pairing.close().await;
    candidate_peer.pairing.close().await;
}

// ---------------------------------------------------------------------------
// Additional data, receipts and persistence
// ---------------------------------------------------------------------------

struct Collect(parking_lot::Mutex<Option<Capability>>);

#[async_trait]
impl PairedHandler for Collect {
    async fn on_paired(&self, capability: &Capability) -> anyhow::Result<()> {
        *self.0.lock() = Some(capability.clone());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn additional_data_reaches_candidate() {
    let (member_peer, candidate_peer) = peers();
    let created = invite(InviteOptions {
        data: Some(b"welcome aboard".to_vec()),
        ..InviteOptions::default()
    });
    let approver = Approver::new(&created, Verdict::Confirm);
    member_peer
        .pairing
        .add_member(MemberOptions::new(created.discovery_key, approver.clone()))
        .unwrap();
    connect(&member_peer, &candidate_peer);

    let collect = Arc::new(Collect(parking_lot::Mutex::new(None)));
    let request = CandidateRequest::from_invite_bytes(&created.invite, b"laptop").unwrap();
    let candidate = candidate_peer
        .pairing
        .add_candidate(
            request,
            CandidateOptions {
                handler: Some(collect.clone()),
                ..CandidateOptions::default()
            },
        )
        .unwrap();

    assert!(matches!(outcome(&candidate).await, PairingOutcome::Accepted(_)));
    let capability = collect.0.lock().clone().expect("paired handler called");
    assert_eq!(capability.data.as_deref(), Some(&b"welcome aboard"[..]));

    // The member kept a receipt binding the candidate's user data.
    let receipt = approver.receipts.lock()[0].clone();
    assert_eq!(
        verify_receipt(&receipt, &created.public_key).as_deref(),
        Some(&b"laptop"[..])
    );

    member_peer.pairing.close().await;
    candidate_peer.pairing.close().await;
}

#[tokio::test(start_paused = true)]
async fn completed_request_cannot_be_reused() {
    let (member_peer, candidate_peer) = peers();
    let created = invite(InviteOptions::default());
    let approver = Approver::new(&created, Verdict::Confirm);
    member_peer
        .pairing
        .add_member(MemberOptions::new(created.discovery_key, approver))
        .unwrap();
    connect(&member_peer, &candidate_peer);

    let request = CandidateRequest::from_invite_bytes(&created.invite, b"laptop").unwrap();
    let candidate = candidate_peer
        .pairing
        .add_candidate(request, CandidateOptions::default())
        .unwrap();
    assert!(matches!(outcome(&candidate).await, PairingOutcome::Accepted(_)));

    let saved = candidate.persist();
    candidate.close().await;

    let restored = CandidateRequest::restore(&saved).unwrap();
    assert!(restored.is_completed());
    let err = candidate_peer
        .pairing
        .add_candidate(restored, CandidateOptions::default())
        .err()
        .unwrap();
    assert_eq!(err, PairingError::RequestClosed);

    member_peer.pairing.close().await;
    candidate_peer.pairing.close().await;
}

#[tokio::test(start_paused = true)]
async fn suspended_registry_pairs_after_resume() {
    let (member_peer, candidate_peer) = peers();
    let created = invite(InviteOptions::default());
    let approver = Approver::new(&created, Verdict::Confirm);

    member_peer.pairing.suspend().await;
    member_peer
        .pairing
        .add_member(MemberOptions::new(created.discovery_key, approver.clone()))
        .unwrap();

    let request = CandidateRequest::from_invite_bytes(&created.invite, b"laptop").unwrap();
    let candidate = candidate_peer
        .pairing
        .add_candidate(request, CandidateOptions::default())
        .unwrap();

    // No connection: only the mailbox can carry the request, and the
    // member does not poll while suspended.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(approver.calls(), 0);
    assert!(candidate.try_outcome().is_none());

    member_peer.pairing.resume();
    assert!(matches!(outcome(&candidate).await, PairingOutcome::Accepted(_)));

    member_peer.pairing.close().await;
    candidate_peer.pairing.close().await;
}

// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Blind Pairing CLI
//!
//! Entry point for the `blind-pair` binary. Every subcommand prints one
//! JSON document on stdout; logs go to stderr.
//!
//! - `invite create|decode`:   invite tooling
//! - `request create`:         build a candidate request
//! - `receipt create|verify`:  receipt tooling
//! - `demo`:                   pair two in-process peers
//! - `version`:                print build version information

mod cli;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde::Serialize;

use blind_pairing::config::{INVITE_VERSION, PROTOCOL_NAME};
use blind_pairing::memory::{MemoryDht, MemorySwarm};
use blind_pairing::pairing::{
    create_invite, create_receipt, decode_invite, verify_receipt, CandidateRequest, Confirmation,
    CreatedInvite, DenyStatus, InviteOptions, MemberRequest,
};
use blind_pairing::rendezvous::{
    BlindPairing, CandidateOptions, MemberOptions, PairingOutcome, RequestHandler,
};
use blind_pairing::PairingConfig;

use cli::{
    BlindPairCli, Commands, DemoArgs, InviteCommand, InviteCreateArgs, ReceiptCommand,
    RequestCommand,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = BlindPairCli::parse();
    logging::init_logging(&cli.log_level, cli.log_format);

    match cli.command {
        Commands::Invite(InviteCommand::Create(args)) => invite_create(args),
        Commands::Invite(InviteCommand::Decode(args)) => invite_decode(&args.invite),
        Commands::Request(RequestCommand::Create(args)) => {
            request_create(&args.invite, &args.user_data)
        }
        Commands::Receipt(ReceiptCommand::Create(args)) => {
            receipt_create(&args.invite, &args.user_data)
        }
        Commands::Receipt(ReceiptCommand::Verify(args)) => {
            receipt_verify(&args.receipt, &args.public_key)
        }
        Commands::Demo(args) => demo(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}

fn decode_hex(label: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value.trim()).with_context(|| format!("{label} is not valid hex"))
}

fn decode_key(label: &str, value: &str) -> Result<[u8; 32]> {
    let bytes = decode_hex(label, value)?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow!("{label} must be 32 bytes, got {}", bytes.len()))
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

#[derive(Serialize)]
struct InviteOutput {
    id: String,
    invite: String,
    public_key: String,
    discovery_key: String,
    expires: Option<u64>,
    sensitive: bool,
    test_invitation: bool,
    additional: Option<AdditionalOutput>,
}

#[derive(Serialize)]
struct AdditionalOutput {
    data: String,
    signature: String,
}

impl From<&CreatedInvite> for InviteOutput {
    fn from(created: &CreatedInvite) -> Self {
        Self {
            id: hex::encode(created.id),
            invite: hex::encode(&created.invite),
            public_key: hex::encode(created.public_key),
            discovery_key: hex::encode(created.discovery_key),
            expires: created.expires,
            sensitive: created.sensitive,
            test_invitation: created.test_invitation,
            additional: created.additional.as_ref().map(|a| AdditionalOutput {
                data: hex::encode(&a.data),
                signature: hex::encode(a.signature),
            }),
        }
    }
}

fn invite_create(args: InviteCreateArgs) -> Result<()> {
    let key = decode_key("key", &args.key)?;
    let discovery_key = args
        .discovery_key
        .as_deref()
        .map(|dk| decode_key("discovery key", dk))
        .transpose()?;

    let created = create_invite(
        &key,
        InviteOptions {
            discovery_key,
            expires: args.expires_in.map(|secs| now_ms() + secs * 1000),
            data: args.data.map(String::into_bytes),
            sensitive: args.sensitive,
            test_invitation: args.test_invitation,
            ..InviteOptions::default()
        },
    );
    tracing::info!(id = %hex::encode(&created.id[..8]), "invite created");
    print_json(&InviteOutput::from(&created))
}

fn invite_decode(invite: &str) -> Result<()> {
    let invite = decode_hex("invite", invite)?;
    let decoded = decode_invite(&invite).context("failed to decode invite")?;

    #[derive(Serialize)]
    struct Decoded {
        id: String,
        discovery_key: Option<String>,
        expires: Option<u64>,
        expired: bool,
        sensitive: bool,
        test_invitation: bool,
    }

    print_json(&Decoded {
        id: hex::encode(decoded.id),
        discovery_key: decoded.invite.discovery_key.map(hex::encode),
        expires: decoded.invite.expires,
        expired: decoded.is_expired(),
        sensitive: decoded.invite.sensitive,
        test_invitation: decoded.invite.test_invitation,
    })
}

fn request_create(invite: &str, user_data: &str) -> Result<()> {
    let invite = decode_hex("invite", invite)?;
    let request = CandidateRequest::from_invite_bytes(&invite, user_data.as_bytes())
        .context("failed to build request")?;

    #[derive(Serialize)]
    struct RequestOutput {
        id: String,
        invite_id: String,
        discovery_key: String,
        request: String,
        persisted: String,
    }

    print_json(&RequestOutput {
        id: hex::encode(request.id()),
        invite_id: hex::encode(request.invite_id()),
        discovery_key: hex::encode(request.discovery_key()),
        request: hex::encode(request.encode()?),
        persisted: hex::encode(request.persist()),
    })
}

fn receipt_create(invite: &str, user_data: &str) -> Result<()> {
    let invite = decode_hex("invite", invite)?;
    let decoded = decode_invite(&invite).context("failed to decode invite")?;
    let created = create_receipt(&decoded.invite, user_data.as_bytes())?;

    print_json(&serde_json::json!({
        "id": hex::encode(created.id),
        "receipt": hex::encode(&created.receipt),
    }))
}

fn receipt_verify(receipt: &str, public_key: &str) -> Result<()> {
    let receipt = decode_hex("receipt", receipt)?;
    let public_key = decode_key("public key", public_key)?;

    let user_data = verify_receipt(&receipt, &public_key);
    print_json(&serde_json::json!({
        "valid": user_data.is_some(),
        "user_data": user_data.map(|data| String::from_utf8_lossy(&data).into_owned()),
    }))
}

/// Member side of the demo: opens with the invite key and answers as told.
struct DemoMember {
    public_key: [u8; 32],
    key: [u8; 32],
    deny: Option<DenyStatus>,
}

#[async_trait]
impl RequestHandler for DemoMember {
    async fn on_request(&self, request: &mut MemberRequest) -> anyhow::Result<()> {
        let user_data = request.open(&self.public_key)?;
        tracing::info!(user_data = %String::from_utf8_lossy(&user_data), "request opened");
        match self.deny {
            Some(status) => request.deny(status)?,
            None => request.confirm(Confirmation::new(self.key))?,
        }
        Ok(())
    }
}

async fn demo(args: DemoArgs) -> Result<()> {
    let deny = match args.deny.as_deref() {
        None => None,
        Some("rejected") => Some(DenyStatus::Rejected),
        Some("used") => Some(DenyStatus::Used),
        Some("expired") => Some(DenyStatus::Expired),
        Some(other) => bail!("unknown deny status: {other}"),
    };

    let key: [u8; 32] = blind_pairing::crypto::random_seed();
    let created = create_invite(&key, InviteOptions::default());

    let config = PairingConfig::default()
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms))
        .with_peer_interval(Duration::from_millis(args.poll_interval_ms));
    let dht = Arc::new(MemoryDht::new());
    let member_swarm = Arc::new(MemorySwarm::new(dht.clone()));
    let candidate_swarm = Arc::new(MemorySwarm::new(dht));
    let member_side = BlindPairing::new(member_swarm.clone(), config.clone());
    let candidate_side = BlindPairing::new(candidate_swarm.clone(), config);

    member_side.add_member(MemberOptions::new(
        created.discovery_key,
        Arc::new(DemoMember {
            public_key: created.public_key,
            key,
            deny,
        }),
    ))?;

    if !args.mailbox_only {
        let (left, right) =
            MemorySwarm::connect(&member_swarm, &candidate_swarm, Duration::from_millis(10));
        member_side.on_connection(left);
        candidate_side.on_connection(right);
    }

    let request = CandidateRequest::from_invite_bytes(&created.invite, args.user_data.as_bytes())?;
    let candidate = candidate_side.add_candidate(request, CandidateOptions::default())?;

    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(args.timeout_secs), candidate.outcome())
        .await
        .map_err(|_| anyhow!("pairing did not finish within {}s", args.timeout_secs))?;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    candidate_side.close().await;
    member_side.close().await;

    let result = match outcome {
        PairingOutcome::Accepted(capability) => serde_json::json!({
            "outcome": "accepted",
            "key_matches": capability.key == key,
            "elapsed_ms": elapsed_ms,
        }),
        PairingOutcome::Rejected(err) => serde_json::json!({
            "outcome": "rejected",
            "reason": err.to_string(),
            "elapsed_ms": elapsed_ms,
        }),
        PairingOutcome::Closed => serde_json::json!({ "outcome": "closed" }),
    };
    print_json(&result)
}

fn print_version() {
    println!(
        "blind-pair {} ({} invite v{})",
        env!("CARGO_PKG_VERSION"),
        PROTOCOL_NAME,
        INVITE_VERSION,
    );
}

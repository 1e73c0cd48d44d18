//! # CLI Interface
//!
//! Argument structure for `blind-pair`, via `clap` derive. Byte arguments
//! (keys, invites, receipts) are hex strings.

use clap::{Args, Parser, Subcommand};

use crate::logging::LogFormat;

/// Blind pairing operator tool.
///
/// Creates and inspects invites, builds candidate requests, checks
/// receipts, and runs a complete pairing in process.
#[derive(Parser, Debug)]
#[command(
    name = "blind-pair",
    about = "Blind pairing invites, requests and receipts",
    version,
    propagate_version = true
)]
pub struct BlindPairCli {
    /// Log output format.
    #[arg(long, global = true, env = "BLIND_PAIR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, global = true, env = "BLIND_PAIR_LOG", default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or inspect invites.
    #[command(subcommand)]
    Invite(InviteCommand),
    /// Build a candidate request from an invite.
    #[command(subcommand)]
    Request(RequestCommand),
    /// Create or verify receipts.
    #[command(subcommand)]
    Receipt(ReceiptCommand),
    /// Pair two in-process peers over the in-memory transport.
    Demo(DemoArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum InviteCommand {
    /// Create an invite for a resource key.
    Create(InviteCreateArgs),
    /// Decode an invite and print its fields.
    Decode(InviteDecodeArgs),
}

#[derive(Args, Debug)]
pub struct InviteCreateArgs {
    /// Hex-encoded 32-byte resource key.
    #[arg(long, env = "BLIND_PAIR_KEY")]
    pub key: String,

    /// Hex-encoded 32-byte discovery key. Derived from the key when omitted.
    #[arg(long)]
    pub discovery_key: Option<String>,

    /// Seconds until the invite expires.
    #[arg(long)]
    pub expires_in: Option<u64>,

    /// Additional data to sign into the invite.
    #[arg(long)]
    pub data: Option<String>,

    /// Mark the invite sensitive.
    #[arg(long)]
    pub sensitive: bool,

    /// Mark the invite as a test invitation.
    #[arg(long)]
    pub test_invitation: bool,
}

#[derive(Args, Debug)]
pub struct InviteDecodeArgs {
    /// Hex-encoded invite.
    pub invite: String,
}

#[derive(Subcommand, Debug)]
pub enum RequestCommand {
    /// Create a request and print its encoding and persisted form.
    Create(RequestCreateArgs),
}

#[derive(Args, Debug)]
pub struct RequestCreateArgs {
    /// Hex-encoded invite.
    #[arg(long)]
    pub invite: String,

    /// User data to present to the member.
    #[arg(long, default_value = "")]
    pub user_data: String,
}

#[derive(Subcommand, Debug)]
pub enum ReceiptCommand {
    /// Create the receipt a member would obtain for this user data.
    Create(ReceiptCreateArgs),
    /// Verify a receipt against an invite public key.
    Verify(ReceiptVerifyArgs),
}

#[derive(Args, Debug)]
pub struct ReceiptCreateArgs {
    /// Hex-encoded invite.
    #[arg(long)]
    pub invite: String,

    #[arg(long, default_value = "")]
    pub user_data: String,
}

#[derive(Args, Debug)]
pub struct ReceiptVerifyArgs {
    /// Hex-encoded receipt.
    #[arg(long)]
    pub receipt: String,

    /// Hex-encoded invite public key.
    #[arg(long)]
    pub public_key: String,
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// User data the candidate presents.
    #[arg(long, default_value = "demo-device")]
    pub user_data: String,

    /// Do not connect the peers; pair through the DHT mailbox only.
    #[arg(long)]
    pub mailbox_only: bool,

    /// Member answers with this deny status instead of confirming.
    #[arg(long, value_parser = ["rejected", "used", "expired"])]
    pub deny: Option<String>,

    /// Base mailbox poll interval in milliseconds.
    #[arg(long, default_value_t = 200)]
    pub poll_interval_ms: u64,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        BlindPairCli::command().debug_assert();
    }

    #[test]
    fn parses_invite_create() {
        let cli = BlindPairCli::try_parse_from([
            "blind-pair",
            "invite",
            "create",
            "--key",
            "00",
            "--expires-in",
            "60",
        ])
        .unwrap();
        match cli.command {
            Commands::Invite(InviteCommand::Create(args)) => {
                assert_eq!(args.key, "00");
                assert_eq!(args.expires_in, Some(60));
                assert!(!args.sensitive);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}

//! # CLI Interface
//!
//! Defines the command-line argument structure for `kestrel-node` using
//! `clap` derive. Two subcommands: `run` and `version`.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;

/// KESTREL full node.
///
/// Connects to the peer-to-peer network, synchronizes the local chain, and
/// relays blocks and transactions.
#[derive(Parser, Debug)]
#[command(
    name = "kestrel-node",
    about = "KESTREL full node",
    version,
    propagate_version = true
)]
pub struct KestrelNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the KESTREL node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Port the P2P listener binds on (all interfaces).
    #[arg(
        long,
        env = "KESTREL_P2P_PORT",
        default_value_t = kestrel_protocol::config::DEFAULT_P2P_PORT
    )]
    pub p2p_port: u16,

    /// Seed addresses to dial on startup (host:port). Repeat the flag or
    /// separate with commas.
    #[arg(long = "seed", env = "KESTREL_SEEDS", value_delimiter = ',')]
    pub seeds: Vec<SocketAddr>,

    /// Keep dialing until this many peers are sync-eligible.
    #[arg(
        long,
        env = "KESTREL_TARGET_PEERS",
        default_value_t = kestrel_protocol::config::TARGET_POOL_SIZE
    )]
    pub target_peers: usize,

    /// Produce an empty block every N milliseconds and broadcast it.
    /// Development aid for exercising propagation; 0 disables.
    #[arg(long, env = "KESTREL_PRODUCE_MS", default_value_t = 0)]
    pub produce_ms: u64,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "KESTREL_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

// Copyright (c) 2026 Kestrel Labs. MIT License.
// See LICENSE for details.

//! # KESTREL Node
//!
//! Entry point for the `kestrel-node` binary. Parses CLI arguments,
//! initializes logging, and wires the sync stack together: in-memory
//! ledger, sync engine, connection manager, outbound dialer, and the
//! periodic tick driver.
//!
//! The binary supports two subcommands:
//!
//! - `run`     — start the node
//! - `version` — print build version information

mod cli;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;

use kestrel_protocol::chain::short_hash;
use kestrel_protocol::ledger::{LedgerDelegate, MemoryLedger};
use kestrel_protocol::network::{
    run_dialer, unix_ms, CandidateBook, ConnectionConfig, ConnectionManager, ConnectorConfig,
    PoolConfig, SyncConfig, SyncEngine,
};

use cli::{Commands, KestrelNodeCli};
use logging::LogFormat;

/// Interval between status log lines while running.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = KestrelNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the full node: P2P listener, dialer, tick driver, and the
/// optional development block producer.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "kestrel_node=info,kestrel_protocol=info",
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        p2p_port = args.p2p_port,
        seeds = args.seeds.len(),
        target_peers = args.target_peers,
        "starting kestrel-node"
    );

    // --- Ledger and sync engine ---
    let ledger = Arc::new(MemoryLedger::new());
    let engine = SyncEngine::new(
        SyncConfig::default(),
        PoolConfig::default(),
        Arc::clone(&ledger) as Arc<dyn LedgerDelegate>,
    )
    .shared();

    // --- Candidate book, seeded from the CLI ---
    let connector_config = ConnectorConfig {
        target_pool_size: args.target_peers,
        ..ConnectorConfig::default()
    };
    let candidates = Arc::new(CandidateBook::new(connector_config.clone()));
    candidates.add_many(&args.seeds);

    // --- Connection manager ---
    let connection_config = ConnectionConfig::new(args.p2p_port);
    tracing::info!(
        node_id = %short_hash(&connection_config.node_id),
        "node identity minted"
    );
    let manager = ConnectionManager::new(connection_config, Arc::clone(&engine), candidates);

    // --- P2P listener ---
    let listen_addr = format!("0.0.0.0:{}", args.p2p_port);
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind P2P listener on {listen_addr}"))?;
    tracing::info!("P2P listener on {listen_addr}");
    tokio::spawn(Arc::clone(&manager).listen(listener));

    // --- Background drivers ---
    tokio::spawn(Arc::clone(&manager).run_ticker());
    tokio::spawn(run_dialer(Arc::clone(&manager), connector_config));

    // --- Development block producer ---
    // Stands in for a consensus engine: commits an empty block on an
    // interval and lets the engine fan the announcement out.
    if args.produce_ms > 0 {
        let ledger = Arc::clone(&ledger);
        let engine = Arc::clone(&engine);
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(args.produce_ms));
            loop {
                interval.tick().await;
                let parent = ledger.current_head();
                let block = kestrel_protocol::chain::Block::new(&parent, vec![]);
                let head = block.head();
                ledger.validate_and_apply(kestrel_protocol::ledger::LedgerItem::Block(block));
                tracing::info!(height = head.height, hash = %short_hash(&head.hash), "block produced");
                let actions = engine.lock().broadcast_block(head, unix_ms());
                manager.execute(actions).await;
            }
        });
    }

    // --- Status loop ---
    let status_manager = Arc::clone(&manager);
    let status_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        loop {
            interval.tick().await;
            let status = status_engine.lock().status();
            tracing::info!(
                height = status.height,
                pooled = status.pooled_peers,
                connected = status_manager.connection_count(),
                in_flight = status.in_flight,
                "node status"
            );
        }
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, disconnecting peers");
    manager.shutdown().await;
    tracing::info!("kestrel-node stopped");
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("kestrel-node {}", env!("CARGO_PKG_VERSION"));
    println!(
        "wire protocol {}",
        kestrel_protocol::config::WIRE_PROTOCOL_VERSION
    );
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

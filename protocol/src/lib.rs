// Copyright (c) 2026 Kestrel Labs. MIT License.
// See LICENSE for details.

//! # KESTREL Protocol — Core Library
//!
//! The peer-to-peer synchronization engine for a KESTREL full node: how a
//! node finds peers, figures out it is behind, downloads what it lacks, and
//! relays what it learns — without trusting any single peer.
//!
//! What this crate is *not*: a consensus engine, a virtual machine, or a
//! database. Chain validation lives behind the [`ledger::LedgerDelegate`]
//! trait; this crate moves bytes and keeps the bookkeeping honest.
//!
//! ## Architecture
//!
//! - **chain** — Hashes, heads, blocks, transactions, inventory references.
//! - **ledger** — The delegate seam to the node's authoritative state, plus
//!   an in-memory implementation for tests and single-node runs.
//! - **network** — Framing, connections, peer curation, and the sync state
//!   machine. The bulk of the crate.
//! - **config** — Protocol constants and default tunables.
//!
//! ## Design Philosophy
//!
//! 1. Peers are ranked, never trusted. Useful ones get more work; lying
//!    ones get disconnected.
//! 2. Every invariant the protocol depends on is enforced in one place,
//!    by one owner.
//! 3. State machines are data, not control flow — you can print them.
//! 4. If it can deadlock, redesign it until it can't.

pub mod chain;
pub mod config;
pub mod ledger;
pub mod network;

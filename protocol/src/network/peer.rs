//! # Peer Identity & Metadata
//!
//! Connections, pool entries, and sync sessions all refer to a peer through
//! a [`PeerId`] — a stable, process-unique integer minted when the raw
//! connection is registered. Nothing outside the connection manager ever
//! holds the transport handle, which is what makes disconnect-time teardown
//! unambiguous: drop the table entry, and every id elsewhere is just a
//! number that stops matching.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::chain::{ChainHead, Hash};
use crate::config;

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Opaque, stable identifier for one connection. Never reused within a
/// process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(u64);

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

impl PeerId {
    /// Mints a fresh id from the process-wide counter.
    pub fn next() -> Self {
        Self(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Fixed ids for tests that need reproducible ordering.
    #[cfg(test)]
    pub fn for_test(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Who initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// The remote side dialed our listener.
    Inbound,
    /// We dialed the remote side.
    Outbound,
}

// ---------------------------------------------------------------------------
// PeerScore
// ---------------------------------------------------------------------------

/// Per-peer reputation counters. Each counter only ever increments — one
/// event, one bump, applied exactly once by the sync engine after it has
/// judged a response. The weighted [`value`](Self::value) is what the pool
/// ranks on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerScore {
    /// Items this peer delivered that the ledger accepted.
    pub delivered: u64,
    /// Items this peer delivered that the ledger rejected.
    pub invalid: u64,
    /// Request deadlines this peer missed.
    pub timeouts: u64,
    /// Deadlines missed with no successful delivery in between. Reset on
    /// every accepted item; drives the unresponsive-peer disconnect.
    pub consecutive_timeouts: u32,
}

impl PeerScore {
    /// Records an accepted delivery.
    pub fn record_delivered(&mut self) {
        self.delivered += 1;
        self.consecutive_timeouts = 0;
    }

    /// Records a ledger rejection.
    pub fn record_invalid(&mut self) {
        self.invalid += 1;
    }

    /// Records a missed deadline.
    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
        self.consecutive_timeouts += 1;
    }

    /// Weighted ranking value. The weights are policy, not protocol — see
    /// `config::SCORE_INVALID_WEIGHT` / `config::SCORE_TIMEOUT_WEIGHT`.
    pub fn value(&self) -> i64 {
        self.delivered as i64
            - config::SCORE_INVALID_WEIGHT * self.invalid as i64
            - config::SCORE_TIMEOUT_WEIGHT * self.timeouts as i64
    }
}

// ---------------------------------------------------------------------------
// PeerInfo
// ---------------------------------------------------------------------------

/// Immutable facts about a handshaked connection, snapshotted out of the
/// connection manager's table for logging and status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Stable connection id.
    pub peer: PeerId,
    /// Remote socket address of the connection itself.
    pub addr: SocketAddr,
    /// Address of the peer's listener, derived from the handshake's
    /// `listen_port`; this is what gets shared via peer exchange.
    pub listen_addr: SocketAddr,
    /// Node identity learned in the handshake.
    pub node_id: Hash,
    /// Negotiated wire protocol version.
    pub protocol_version: u16,
    /// Who dialed whom.
    pub direction: Direction,
    /// Chain head the peer advertised at handshake time.
    pub head: ChainHead,
    /// Unix milliseconds when the handshake completed.
    pub connected_at: u64,
}

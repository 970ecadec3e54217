//! # Protocol Configuration & Constants
//!
//! Every magic number in KESTREL lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Per-component tunables (`ConnectionConfig`, `PoolConfig`, `SyncConfig`,
//! `ConnectorConfig`) take their defaults from these constants; tests and
//! deployments override the structs, never the constants.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Wire Identification
// ---------------------------------------------------------------------------

/// Protocol magic bytes used in the P2P wire format preamble. Every KESTREL
/// frame on the wire starts with these 4 bytes so peers can quickly reject
/// foreign traffic without parsing further.
pub const PROTOCOL_MAGIC: u32 = 0x4B53_5452; // "KSTR"

/// Wire protocol version exchanged during the handshake. Peers whose major
/// wire version differs from ours are rejected with `IncompatibleVersion`.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// Default TCP port for P2P communication.
pub const DEFAULT_P2P_PORT: u16 = 9650;

// ---------------------------------------------------------------------------
// Framing Limits
// ---------------------------------------------------------------------------

/// Maximum payload size of a single frame, in bytes. A malicious peer
/// announcing a larger length is cut off before any allocation happens.
pub const MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;

/// Maximum number of hashes accepted in a single `Inventory` or `GetData`
/// message. Larger announcements are a protocol violation.
pub const MAX_INVENTORY_HASHES: usize = 4_096;

/// Maximum number of addresses accepted in a single `PeerExchange` message.
pub const MAX_EXCHANGED_ADDRESSES: usize = 64;

// ---------------------------------------------------------------------------
// Connection Limits
// ---------------------------------------------------------------------------

/// Maximum number of simultaneous connections (inbound + outbound).
pub const MAX_CONNECTIONS: usize = 64;

/// Maximum number of simultaneous connections from a single IP address.
pub const MAX_CONNECTIONS_PER_IP: usize = 2;

/// How long a fresh connection may take to complete the handshake before
/// it is dropped. Keeps half-open sockets from pinning resources.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Sync Pool
// ---------------------------------------------------------------------------

/// Maximum number of sync-eligible peers the pool will rank.
pub const POOL_CAPACITY: usize = 30;

/// The outbound connector keeps dialing until the pool reaches this size.
pub const TARGET_POOL_SIZE: usize = 8;

// ---------------------------------------------------------------------------
// Sync Engine
// ---------------------------------------------------------------------------

/// Number of block hashes requested per catch-up probe, and therefore the
/// upper bound on one request window. Larger batches amortize round trips
/// but hold more data in flight.
pub const SYNC_BATCH_LIMIT: u64 = 100;

/// Number of peers the engine will sync from in parallel. More fan-out
/// means faster catch-up and more memory in flight.
pub const PARALLEL_SYNC_FANOUT: usize = 4;

/// Deadline for any outstanding request (inventory probe or data fetch).
/// Expiry is handled by the periodic tick, not per-message.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Interval between deadline sweeps and sync-scheduling passes.
pub const TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive request timeouts after which a peer is disconnected rather
/// than merely penalized.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Size of the recently-accepted-item set used for duplicate suppression.
/// A recency window, not a ledger replacement.
pub const RECENT_ITEM_CACHE_SIZE: usize = 16_384;

// ---------------------------------------------------------------------------
// Peer Scoring
// ---------------------------------------------------------------------------
//
// The exact formula is a tunable policy, not a wire contract. Invalid data
// weighs heavier than slowness: a slow peer wastes time, a lying peer wastes
// time *and* trust.

/// Score subtracted per item the ledger rejected as invalid.
pub const SCORE_INVALID_WEIGHT: i64 = 4;

/// Score subtracted per request deadline missed.
pub const SCORE_TIMEOUT_WEIGHT: i64 = 2;

// ---------------------------------------------------------------------------
// Outbound Connector
// ---------------------------------------------------------------------------

/// First retry delay after a failed dial; doubles per consecutive failure.
pub const DIAL_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Ceiling for the per-address dial backoff.
pub const DIAL_BACKOFF_CAP: Duration = Duration::from_secs(120);

/// Pause between dial-loop passes when the pool is already populated.
pub const DIAL_LOOP_INTERVAL: Duration = Duration::from_secs(5);

/// Maximum number of candidate addresses remembered by the connector.
pub const MAX_CANDIDATE_ADDRESSES: usize = 1_024;

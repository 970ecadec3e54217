//! # Network Module
//!
//! The P2P synchronization layer of KESTREL: framing, connection lifecycle,
//! peer curation, and the sync state machine that keeps the local ledger
//! converging on the network's chain.
//!
//! ## Architecture
//!
//! ```text
//! wire.rs       — Frame codec and the message set (pure, no sockets)
//! peer.rs       — Peer identity, direction, reputation counters
//! manager.rs    — Socket ownership, handshake gate, per-connection tasks
//! pool.rs       — Bounded, ranked set of sync-eligible peers
//! session.rs    — Per-peer sync phase machine
//! engine.rs     — The orchestrator: correlation, scoring, fan-out
//! connector.rs  — Candidate address book and the outbound dial loop
//! ```
//!
//! ## Design Decisions
//!
//! - The engine is sans-IO: it consumes messages and clock ticks, returns
//!   `SyncAction`s, and owns the pool, the sessions, and the in-flight map
//!   as a single writer. Every hard invariant (one in-flight request per
//!   item, clean disconnect teardown) is a property of one struct that
//!   tests drive without sockets.
//! - The manager is the only component that holds transport handles.
//!   Everything else speaks `PeerId`, so "disconnect" is one table removal
//!   plus one engine call, idempotent from any direction.
//! - Ledger validation never runs under the engine lock. Received batches
//!   queue onto the manager's bounded apply worker, which commits the
//!   outcomes back to the engine afterwards; one slow apply stalls the
//!   queue, not every peer's frame dispatch.
//! - Request timeouts are detected only by the periodic tick, never
//!   per-message. A silent peer costs at most one sweep of latency and can
//!   never hang a session.
//! - Wall-clock time flows in as a `u64` of unix milliseconds everywhere
//!   below the manager, which is what makes deadline behaviour testable.

pub mod connector;
pub mod engine;
pub mod manager;
pub mod peer;
pub mod pool;
pub mod session;
pub mod wire;

pub use connector::{run_dialer, CandidateBook, ConnectorConfig};
pub use engine::{apply_batch, EngineStatus, SharedEngine, SyncAction, SyncConfig, SyncEngine};
pub use manager::{ConnectionConfig, ConnectionManager, HandshakeError};
pub use peer::{Direction, PeerId, PeerInfo, PeerScore};
pub use pool::{Admission, PoolConfig, PoolEntry, Selection, SyncPool};
pub use session::{SessionError, SyncPhase, SyncSession};
pub use wire::{
    decode_frame, encode_frame, read_frame, write_frame, DisconnectReason, FrameError, Message,
};

/// Current wall-clock time as unix milliseconds. The one place the sync
/// layer reads the clock; everything below the manager takes `now` as an
/// argument.
pub fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

//! # Sync Session
//!
//! One per-peer state machine instance, created when a peer enters the pool
//! and destroyed no later than its connection. The phase loop is:
//!
//! ```text
//! Idle → HeadExchanged → Requesting → Applying → Idle  (repeat)
//!   \________________________________________→ Detached (disconnect)
//! ```
//!
//! Phases are a tagged variant plus explicit transition methods rather than
//! dispatch-per-message-type, so every legal (and illegal) transition is
//! spelled out and exhaustively testable. A message that arrives in the
//! wrong phase is rejected with [`SessionError::UnexpectedMessage`] — the
//! engine treats that as a protocol violation by the peer.
//!
//! Transaction gossip deliberately bypasses the phase machine: announce →
//! request-if-unknown → apply is a single round with no batching state.

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

use crate::chain::Hash;
use crate::network::peer::{PeerId, PeerScore};

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Where a session is in the catch-up loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    /// No outstanding request. The engine may start a probe when the peer's
    /// advertised head exceeds ours.
    Idle,
    /// A `GetInventory` probe is outstanding.
    HeadExchanged {
        /// First height the probe asked about.
        probe_from: u64,
        /// Unix ms after which the probe counts as timed out.
        deadline: u64,
    },
    /// A `GetData` batch is outstanding.
    Requesting {
        /// The exact hashes requested, in request order.
        window: Vec<Hash>,
        /// Unix ms after which the batch counts as timed out.
        deadline: u64,
    },
    /// Received payloads are being fed to the ledger in arrival order.
    /// Keeps the window so the commit step can release unserved hashes.
    Applying {
        /// The hashes the payloads were checked against.
        window: Vec<Hash>,
    },
    /// The connection is gone. Terminal.
    Detached,
}

impl SyncPhase {
    /// Short tag for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::HeadExchanged { .. } => "head_exchanged",
            Self::Requesting { .. } => "requesting",
            Self::Applying { .. } => "applying",
            Self::Detached => "detached",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A transition that the phase machine does not allow.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The peer sent something that is not legal in the current phase.
    #[error("unexpected {message} while {phase}")]
    UnexpectedMessage {
        /// Phase name at the time of the violation.
        phase: &'static str,
        /// Offending message kind.
        message: &'static str,
    },
    /// The session is detached; nothing further is legal.
    #[error("session is detached")]
    Detached,
}

// ---------------------------------------------------------------------------
// SyncSession
// ---------------------------------------------------------------------------

/// Per-peer sync state: the phase machine, the peer's reputation counters,
/// and the set of items we know the peer has (for rebroadcast suppression).
#[derive(Debug)]
pub struct SyncSession {
    /// The connection this session belongs to.
    pub peer: PeerId,
    phase: SyncPhase,
    /// Reputation counters, mutated only through the record_* methods so
    /// each event is applied exactly once.
    pub score: PeerScore,
    /// Hashes this peer has announced or delivered to us. An announce for
    /// any of these is never echoed back.
    known: HashSet<Hash>,
}

impl SyncSession {
    /// Fresh session in `Idle` for a just-pooled peer.
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            phase: SyncPhase::Idle,
            score: PeerScore::default(),
            known: HashSet::new(),
        }
    }

    /// Current phase (read-only).
    pub fn phase(&self) -> &SyncPhase {
        &self.phase
    }

    /// True once the session has been detached.
    pub fn is_detached(&self) -> bool {
        matches!(self.phase, SyncPhase::Detached)
    }

    /// True when the engine may issue a new request to this peer.
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, SyncPhase::Idle)
    }

    fn guard_attached(&self) -> Result<(), SessionError> {
        if self.is_detached() {
            Err(SessionError::Detached)
        } else {
            Ok(())
        }
    }

    /// `Idle → HeadExchanged`: a `GetInventory` probe went out.
    pub fn begin_probe(&mut self, probe_from: u64, deadline: u64) -> Result<(), SessionError> {
        self.guard_attached()?;
        match self.phase {
            SyncPhase::Idle => {
                self.phase = SyncPhase::HeadExchanged {
                    probe_from,
                    deadline,
                };
                Ok(())
            }
            ref phase => Err(SessionError::UnexpectedMessage {
                phase: phase.name(),
                message: "probe",
            }),
        }
    }

    /// Consumes the outstanding probe when its `Inventory` answer arrives.
    /// Returns the height the probe started at; the session drops back to
    /// `Idle` and the engine decides whether a batch request follows.
    pub fn probe_answered(&mut self) -> Result<u64, SessionError> {
        self.guard_attached()?;
        match self.phase {
            SyncPhase::HeadExchanged { probe_from, .. } => {
                self.phase = SyncPhase::Idle;
                Ok(probe_from)
            }
            ref phase => Err(SessionError::UnexpectedMessage {
                phase: phase.name(),
                message: "inventory",
            }),
        }
    }

    /// `Idle → Requesting`: a `GetData` batch went out for exactly `window`.
    pub fn begin_request(&mut self, window: Vec<Hash>, deadline: u64) -> Result<(), SessionError> {
        self.guard_attached()?;
        match self.phase {
            SyncPhase::Idle => {
                self.phase = SyncPhase::Requesting { window, deadline };
                Ok(())
            }
            ref phase => Err(SessionError::UnexpectedMessage {
                phase: phase.name(),
                message: "request",
            }),
        }
    }

    /// `Requesting → Applying`: the `Blocks` answer arrived. The window
    /// stays in the phase; inspect it via [`window`](Self::window).
    pub fn begin_applying(&mut self) -> Result<(), SessionError> {
        self.guard_attached()?;
        match std::mem::replace(&mut self.phase, SyncPhase::Idle) {
            SyncPhase::Requesting { window, .. } => {
                self.phase = SyncPhase::Applying { window };
                Ok(())
            }
            phase => {
                // Not legal: put the phase back and report.
                let name = phase.name();
                self.phase = phase;
                Err(SessionError::UnexpectedMessage {
                    phase: name,
                    message: "blocks",
                })
            }
        }
    }

    /// The request window, while one exists (`Requesting` or `Applying`).
    pub fn window(&self) -> Option<&[Hash]> {
        match &self.phase {
            SyncPhase::Requesting { window, .. } | SyncPhase::Applying { window } => {
                Some(window)
            }
            _ => None,
        }
    }

    /// `Applying → Idle`: the batch outcomes were committed. Returns the
    /// spent window so the caller can release unserved reservations.
    pub fn finish_applying(&mut self) -> Result<Vec<Hash>, SessionError> {
        self.guard_attached()?;
        match std::mem::replace(&mut self.phase, SyncPhase::Idle) {
            SyncPhase::Applying { window } => Ok(window),
            phase => {
                let name = phase.name();
                self.phase = phase;
                Err(SessionError::UnexpectedMessage {
                    phase: name,
                    message: "finish",
                })
            }
        }
    }

    /// The deadline of the outstanding request, if one is in flight.
    pub fn outstanding_deadline(&self) -> Option<u64> {
        match self.phase {
            SyncPhase::HeadExchanged { deadline, .. } => Some(deadline),
            SyncPhase::Requesting { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    /// Cancels the outstanding request, if its phase carries a deadline,
    /// and returns the hashes that were reserved for it (so the engine can
    /// release them from the global in-flight map). Used for timeouts; a
    /// batch already in `Applying` has been answered and is left alone.
    pub fn cancel_outstanding(&mut self) -> Vec<Hash> {
        match std::mem::replace(&mut self.phase, SyncPhase::Idle) {
            SyncPhase::Requesting { window, .. } => window,
            SyncPhase::HeadExchanged { .. } => Vec::new(),
            phase => {
                self.phase = phase;
                Vec::new()
            }
        }
    }

    /// Terminal transition; legal from every phase and idempotent. Returns
    /// the reserved hashes, as [`cancel_outstanding`](Self::cancel_outstanding).
    pub fn detach(&mut self) -> Vec<Hash> {
        match std::mem::replace(&mut self.phase, SyncPhase::Detached) {
            SyncPhase::Requesting { window, .. } | SyncPhase::Applying { window } => window,
            _ => Vec::new(),
        }
    }

    /// Remembers that the peer has this item.
    pub fn note_known(&mut self, hash: Hash) {
        self.known.insert(hash);
    }

    /// Has the peer announced or delivered this item?
    pub fn knows(&self, hash: &Hash) -> bool {
        self.known.contains(hash)
    }
}

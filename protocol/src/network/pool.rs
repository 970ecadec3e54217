//! # Sync Pool
//!
//! The curated subset of handshaked peers eligible for chain-sync duty.
//! Bounded, ranked, and deterministic: two pools fed identical events rank
//! identically, which keeps eviction and selection reproducible under test.
//!
//! ## Ranking
//!
//! Entries are ordered by a composite key — score descending, then
//! most-recently-useful first, then connection age (older preferred), then
//! `PeerId` as a final tiebreaker so the order is total. The same pattern as
//! a fee-priority index, just ranking reputations instead of fees.
//!
//! The pool never talks to the network. It is owned by the sync engine
//! (single writer) and answers three questions: who gets admitted, who do we
//! sync from, and who has gone stale.

use std::collections::HashMap;

use crate::chain::ChainHead;
use crate::config;
use crate::network::peer::PeerId;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunable parameters for pool behaviour.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of sync-eligible peers.
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: config::POOL_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One sync-eligible peer, as the pool tracks it.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    /// Stable connection id.
    pub peer: PeerId,
    /// The peer's last advertised chain head.
    pub head: ChainHead,
    /// Weighted reputation value, pushed in by the sync engine. The pool
    /// only reads it.
    pub score: i64,
    /// Unix milliseconds when the peer entered the pool.
    pub joined_at: u64,
    /// Unix milliseconds of the last accepted delivery from this peer.
    /// Zero until the peer delivers something, so proven peers rank above
    /// fresh ones at equal score.
    pub last_useful: u64,
    /// Deadline of the peer's outstanding request, if one is in flight.
    /// A peer with a live deadline is busy; one past it is stale.
    pub deadline: Option<u64>,
}

impl PoolEntry {
    /// A fresh entry for a just-handshaked peer.
    pub fn new(peer: PeerId, head: ChainHead, now: u64) -> Self {
        Self {
            peer,
            head,
            score: 0,
            joined_at: now,
            last_useful: 0,
            deadline: None,
        }
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The peer joined a pool that had room.
    Admitted,
    /// The peer joined a full pool; the named lower-ranked peer must be
    /// evicted (disconnect reason: pool full).
    Evicting(PeerId),
    /// The pool is full and the incoming peer does not outrank the worst
    /// member. It stays connected but is not sync-eligible.
    Rejected,
}

/// Result of a `select` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Up to k distinct idle peers, best-ranked first.
    pub selected: Vec<PeerId>,
    /// Peers whose outstanding request is past its deadline. The caller
    /// hands these to the connection manager.
    pub stale: Vec<PeerId>,
}

// ---------------------------------------------------------------------------
// SyncPool
// ---------------------------------------------------------------------------

/// The ranked set of sync-eligible peers.
pub struct SyncPool {
    config: PoolConfig,
    entries: HashMap<PeerId, PoolEntry>,
}

impl SyncPool {
    /// Creates an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Number of pooled peers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no peers are pooled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Is this peer sync-eligible?
    pub fn contains(&self, peer: PeerId) -> bool {
        self.entries.contains_key(&peer)
    }

    /// Attempts to admit a freshly handshaked peer.
    ///
    /// On `Evicting(victim)` the caller must actually disconnect the victim;
    /// the pool has already removed it and installed the newcomer.
    pub fn admit(&mut self, entry: PoolEntry) -> Admission {
        if self.entries.contains_key(&entry.peer) {
            // Re-admission is a no-op; the existing entry keeps its history.
            return Admission::Admitted;
        }
        if self.entries.len() < self.config.capacity {
            self.entries.insert(entry.peer, entry);
            return Admission::Admitted;
        }

        // Full: find the worst-ranked member.
        let worst = self
            .ranked()
            .last()
            .map(|e| e.peer)
            .expect("full pool has a worst entry");
        let outranks = {
            let worst_entry = &self.entries[&worst];
            Self::compare(&entry, worst_entry) == std::cmp::Ordering::Less
        };
        if !outranks {
            return Admission::Rejected;
        }
        self.entries.remove(&worst);
        self.entries.insert(entry.peer, entry);
        Admission::Evicting(worst)
    }

    /// Removes a peer. Idempotent; returns whether it was present.
    pub fn remove(&mut self, peer: PeerId) -> bool {
        self.entries.remove(&peer).is_some()
    }

    /// Pushes the engine's latest score for a peer.
    pub fn update_score(&mut self, peer: PeerId, score: i64) {
        if let Some(entry) = self.entries.get_mut(&peer) {
            entry.score = score;
        }
    }

    /// Records a newly advertised chain head.
    pub fn update_head(&mut self, peer: PeerId, head: ChainHead) {
        if let Some(entry) = self.entries.get_mut(&peer) {
            entry.head = head;
        }
    }

    /// Records that a peer just delivered something useful.
    pub fn mark_useful(&mut self, peer: PeerId, now: u64) {
        if let Some(entry) = self.entries.get_mut(&peer) {
            entry.last_useful = now;
        }
    }

    /// Marks a peer as having an outstanding request due at `deadline`.
    pub fn set_deadline(&mut self, peer: PeerId, deadline: u64) {
        if let Some(entry) = self.entries.get_mut(&peer) {
            entry.deadline = Some(deadline);
        }
    }

    /// Clears a peer's outstanding-request marker (answered or cancelled).
    pub fn clear_deadline(&mut self, peer: PeerId) {
        if let Some(entry) = self.entries.get_mut(&peer) {
            entry.deadline = None;
        }
    }

    /// The advertised head of a pooled peer.
    pub fn head_of(&self, peer: PeerId) -> Option<ChainHead> {
        self.entries.get(&peer).map(|e| e.head)
    }

    /// Up to `k` distinct idle peers for parallel fan-out, best first.
    /// Peers past their request deadline are reported as stale instead of
    /// selected; peers with a live outstanding request are skipped entirely
    /// (backpressure: a busy peer is not re-selected until it answers or
    /// times out).
    pub fn select(&self, k: usize, now: u64) -> Selection {
        let mut selection = Selection::default();
        for entry in self.ranked() {
            match entry.deadline {
                Some(deadline) if deadline <= now => selection.stale.push(entry.peer),
                Some(_) => {}
                None => {
                    if selection.selected.len() < k {
                        selection.selected.push(entry.peer);
                    }
                }
            }
        }
        selection
    }

    /// The single best idle peer whose advertised head exceeds the local
    /// height, or `None` when we're caught up (or everyone is busy).
    pub fn best(&self, local_height: u64) -> Option<PeerId> {
        self.ranked()
            .into_iter()
            .filter(|e| e.head.height > local_height)
            .find(|e| e.deadline.is_none())
            .map(|e| e.peer)
    }

    /// All pooled peers in rank order. Used for announce fan-out.
    pub fn peers_ranked(&self) -> Vec<PeerId> {
        self.ranked().into_iter().map(|e| e.peer).collect()
    }

    /// Entries sorted by the composite ranking key. O(n log n) per call;
    /// the pool is small and selection is not on the per-message hot path.
    fn ranked(&self) -> Vec<&PoolEntry> {
        let mut entries: Vec<&PoolEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| Self::compare(a, b));
        entries
    }

    /// Total order: score desc, last_useful desc, joined_at asc, peer asc.
    fn compare(a: &PoolEntry, b: &PoolEntry) -> std::cmp::Ordering {
        b.score
            .cmp(&a.score)
            .then_with(|| b.last_useful.cmp(&a.last_useful))
            .then_with(|| a.joined_at.cmp(&b.joined_at))
            .then_with(|| a.peer.cmp(&b.peer))
    }
}

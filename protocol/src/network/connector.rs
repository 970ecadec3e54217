//! # Outbound Connector
//!
//! Keeps the node from starving for peers. The connector remembers every
//! dialable address it has heard about — seed configuration plus
//! `PeerExchange` gossip — and dials from that book whenever the sync pool
//! is below target, with capped exponential backoff per address so a dead
//! seed does not burn a dial slot every pass.
//!
//! The address book ([`CandidateBook`]) is plain shared state behind a
//! mutex; the dial loop ([`run_dialer`]) is the only async part. Dial
//! attempts lease their address for the handshake window so two passes
//! never race on the same candidate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, trace};

use crate::config;
use crate::network::manager::{ConnectionManager, HandshakeError};
use crate::network::unix_ms;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connector tunables. Defaults come from `config`.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Dial until the sync pool holds this many peers.
    pub target_pool_size: usize,
    /// Pause between dial-loop passes.
    pub dial_interval: Duration,
    /// First retry delay after a failed dial.
    pub backoff_base: Duration,
    /// Ceiling for the per-address backoff.
    pub backoff_cap: Duration,
    /// Maximum number of remembered addresses.
    pub max_candidates: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            target_pool_size: config::TARGET_POOL_SIZE,
            dial_interval: config::DIAL_LOOP_INTERVAL,
            backoff_base: config::DIAL_BACKOFF_BASE,
            backoff_cap: config::DIAL_BACKOFF_CAP,
            max_candidates: config::MAX_CANDIDATE_ADDRESSES,
        }
    }
}

// ---------------------------------------------------------------------------
// CandidateBook
// ---------------------------------------------------------------------------

/// Dial bookkeeping for one known address.
#[derive(Debug, Clone, Default)]
struct DialState {
    /// Consecutive failed dials since the last success.
    failures: u32,
    /// Unix ms before which this address must not be dialed.
    not_before: u64,
    /// A live outbound connection exists to this address.
    connected: bool,
}

/// Every address the node knows how to dial, with per-address backoff.
/// Fed by seed config and `PeerExchange`; drained by the dial loop.
pub struct CandidateBook {
    config: ConnectorConfig,
    entries: Mutex<HashMap<SocketAddr, DialState>>,
}

impl CandidateBook {
    /// An empty book.
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of remembered addresses.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no addresses are known.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remembers an address. Returns false when the book is at capacity or
    /// the address is already known.
    pub fn add(&self, addr: SocketAddr) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&addr) {
            return false;
        }
        if entries.len() >= self.config.max_candidates {
            trace!(%addr, "candidate book full, address dropped");
            return false;
        }
        entries.insert(addr, DialState::default());
        true
    }

    /// Remembers a batch of gossiped addresses.
    pub fn add_many(&self, addrs: &[SocketAddr]) {
        for addr in addrs {
            self.add(*addr);
        }
    }

    /// Forgets an address entirely. Used when a dial proves the address is
    /// our own listener.
    pub fn remove(&self, addr: SocketAddr) {
        self.entries.lock().remove(&addr);
    }

    /// Up to `limit` addresses that are due for a dial attempt. Each
    /// returned address is leased until the handshake window passes, so a
    /// concurrent pass will not pick it again before the attempt resolves.
    pub fn due(&self, now: u64, limit: usize) -> Vec<SocketAddr> {
        let lease = config::HANDSHAKE_TIMEOUT.as_millis() as u64;
        let mut entries = self.entries.lock();
        let mut due: Vec<SocketAddr> = entries
            .iter()
            .filter(|(_, state)| !state.connected && state.not_before <= now)
            .map(|(addr, _)| *addr)
            .collect();
        // Fewest failures first: proven addresses before flaky ones.
        due.sort_by_key(|addr| entries[addr].failures);
        due.truncate(limit);
        for addr in &due {
            if let Some(state) = entries.get_mut(addr) {
                state.not_before = now + lease;
            }
        }
        due
    }

    /// A dial to this address completed its handshake.
    pub fn record_success(&self, addr: SocketAddr) {
        if let Some(state) = self.entries.lock().get_mut(&addr) {
            state.failures = 0;
            state.connected = true;
        }
    }

    /// A dial to this address failed. Schedules the retry with jittered
    /// exponential backoff.
    pub fn record_failure(&self, addr: SocketAddr, now: u64) {
        if let Some(state) = self.entries.lock().get_mut(&addr) {
            state.failures = state.failures.saturating_add(1);
            state.connected = false;
            state.not_before = now + self.backoff_ms(state.failures);
        }
    }

    /// The outbound connection to this address closed; the address becomes
    /// dialable again after the base delay.
    pub fn release(&self, addr: SocketAddr, now: u64) {
        if let Some(state) = self.entries.lock().get_mut(&addr) {
            state.connected = false;
            state.not_before = now + self.config.backoff_base.as_millis() as u64;
        }
    }

    /// `base * 2^(failures-1)`, capped, plus up to 25% jitter so a batch of
    /// addresses that failed together does not retry in lockstep.
    fn backoff_ms(&self, failures: u32) -> u64 {
        let base = self.config.backoff_base.as_millis() as u64;
        let cap = self.config.backoff_cap.as_millis() as u64;
        let exp = failures.saturating_sub(1).min(30);
        let delay = base.saturating_mul(1u64 << exp).min(cap);
        delay + rand::thread_rng().gen_range(0..=delay / 4)
    }
}

// ---------------------------------------------------------------------------
// Dial loop
// ---------------------------------------------------------------------------

/// Dials candidates until the sync pool reaches its target size. Spawn
/// this; it runs for the life of the node.
pub async fn run_dialer(manager: Arc<ConnectionManager>, config: ConnectorConfig) {
    let mut interval = tokio::time::interval(config.dial_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let deficit = config
            .target_pool_size
            .saturating_sub(manager.pooled_peers());
        if deficit == 0 {
            continue;
        }
        let due = manager.candidates().due(unix_ms(), deficit);
        if due.is_empty() {
            continue;
        }
        debug!(deficit, dialing = due.len(), "pool below target, dialing");
        for addr in due {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                match manager.connect(addr).await {
                    Ok(peer) => {
                        info!(%peer, %addr, "outbound dial succeeded");
                        manager.candidates().record_success(addr);
                    }
                    Err(HandshakeError::SelfConnection) => {
                        debug!(%addr, "address is our own listener, forgetting it");
                        manager.candidates().remove(addr);
                    }
                    Err(error) => {
                        debug!(%addr, %error, "dial failed");
                        manager.candidates().record_failure(addr, unix_ms());
                    }
                }
            });
        }
    }
}

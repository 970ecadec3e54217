//! # Sync Engine
//!
//! The orchestrator. Runs the per-peer sync state machines, correlates
//! announcements with requests, feeds received data to the ledger delegate,
//! scores peers on the outcome, and fans accepted items back out to the
//! rest of the pool.
//!
//! ## Sans-IO
//!
//! The engine performs no network I/O. Every entry point takes the current
//! time and returns a list of [`SyncAction`]s; the connection manager
//! executes them. This keeps the hard invariants — at most one in-flight
//! request per item, no orphaned bookkeeping after a disconnect — properties
//! of one single-writer struct that tests can drive deterministically,
//! without spinning up sockets.
//!
//! Ledger work is kept off the engine lock the same way: a received batch
//! leaves `handle_message` as [`SyncAction::Apply`], the manager's apply
//! worker runs it through the delegate, and the outcomes come back through
//! [`SyncEngine::batch_applied`]. A slow `validate_and_apply` therefore
//! stalls the apply queue, never every peer's frame dispatch.
//!
//! ## The in-flight map
//!
//! `in_flight` is keyed by item hash, globally, not per peer. Reserving a
//! hash before issuing `GetData` is what guarantees the same item is never
//! requested from two peers concurrently: the second announcer finds the
//! hash reserved and simply is not asked. Disconnects and timeouts release
//! reservations so another peer may serve the item — no progress is lost.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::chain::{short_hash, ChainHead, Hash, InventoryItem, ItemKind};
use crate::config;
use crate::ledger::{ApplyOutcome, LedgerDelegate, LedgerItem};
use crate::network::peer::PeerId;
use crate::network::pool::{Admission, PoolConfig, PoolEntry, SyncPool};
use crate::network::session::{SyncPhase, SyncSession};
use crate::network::wire::{DisconnectReason, Message};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the sync engine. Defaults come from `config`.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on one request window (blocks per batch).
    pub batch_limit: u64,
    /// Milliseconds before an outstanding request counts as timed out.
    pub request_timeout_ms: u64,
    /// Number of peers to drive catch-up from in parallel.
    pub parallel_fanout: usize,
    /// Consecutive timeouts after which a peer is disconnected.
    pub max_consecutive_timeouts: u32,
    /// Size of the recently-accepted recency set.
    pub recent_cache_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_limit: config::SYNC_BATCH_LIMIT,
            request_timeout_ms: config::REQUEST_TIMEOUT.as_millis() as u64,
            parallel_fanout: config::PARALLEL_SYNC_FANOUT,
            max_consecutive_timeouts: config::MAX_CONSECUTIVE_TIMEOUTS,
            recent_cache_size: config::RECENT_ITEM_CACHE_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// What the engine wants the network layer to do. The engine decides; the
/// connection manager executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Send a message to one peer.
    Send {
        /// Target connection.
        peer: PeerId,
        /// Message to deliver.
        message: Message,
    },
    /// Close a connection with a reason.
    Disconnect {
        /// Target connection.
        peer: PeerId,
        /// Reason code to send before closing.
        reason: DisconnectReason,
    },
    /// Hand dialable addresses to the outbound connector.
    AddCandidates(Vec<SocketAddr>),
    /// Run a received batch through the ledger on the apply worker and
    /// feed the outcomes back via [`SyncEngine::batch_applied`].
    Apply {
        /// Peer that delivered the batch.
        peer: PeerId,
        /// Items in arrival order. One kind per batch.
        items: Vec<LedgerItem>,
    },
}

/// Runs a batch through the ledger in arrival order, collecting outcomes
/// for [`SyncEngine::batch_applied`]. A rejected block cuts the batch
/// short: nothing later in the window can link past it.
pub fn apply_batch(
    ledger: &dyn LedgerDelegate,
    items: Vec<LedgerItem>,
) -> Vec<(InventoryItem, ApplyOutcome)> {
    let mut outcomes = Vec::with_capacity(items.len());
    for item in items {
        let inventory = item.inventory();
        let outcome = ledger.validate_and_apply(item);
        let cut_short =
            inventory.kind == ItemKind::Block && matches!(outcome, ApplyOutcome::Rejected(_));
        outcomes.push((inventory, outcome));
        if cut_short {
            break;
        }
    }
    outcomes
}

// ---------------------------------------------------------------------------
// Local Chain View
// ---------------------------------------------------------------------------

/// The node's own best-known head plus a bounded recency set of accepted
/// item hashes for duplicate suppression. A cache, not a ledger: the
/// delegate stays authoritative, and the head only ever moves to whatever
/// the delegate reports after an accepted apply.
struct LocalChainView {
    head: ChainHead,
    recent: HashSet<Hash>,
    recent_order: VecDeque<Hash>,
    capacity: usize,
}

impl LocalChainView {
    fn new(head: ChainHead, capacity: usize) -> Self {
        Self {
            head,
            recent: HashSet::new(),
            recent_order: VecDeque::new(),
            capacity,
        }
    }

    fn note_recent(&mut self, hash: Hash) {
        if self.recent.insert(hash) {
            self.recent_order.push_back(hash);
            while self.recent_order.len() > self.capacity {
                if let Some(old) = self.recent_order.pop_front() {
                    self.recent.remove(&old);
                }
            }
        }
    }

    fn seen_recently(&self, hash: &Hash) -> bool {
        self.recent.contains(hash)
    }
}

/// One reserved request in the global in-flight map.
#[derive(Debug, Clone)]
struct InFlightRequest {
    peer: PeerId,
    kind: ItemKind,
    deadline: u64,
}

/// Point-in-time snapshot for status logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    /// Local best height.
    pub height: u64,
    /// Number of sync-eligible peers.
    pub pooled_peers: usize,
    /// Number of reserved in-flight items.
    pub in_flight: usize,
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

/// The sync orchestrator. Owns the pool, the sessions, the in-flight map,
/// and the local chain view; single writer for all of them.
pub struct SyncEngine {
    sync: SyncConfig,
    ledger: Arc<dyn LedgerDelegate>,
    pool: SyncPool,
    sessions: HashMap<PeerId, SyncSession>,
    in_flight: HashMap<Hash, InFlightRequest>,
    view: LocalChainView,
}

/// The engine behind the lock the network layer shares.
pub type SharedEngine = Arc<parking_lot::Mutex<SyncEngine>>;

impl SyncEngine {
    /// Creates an engine over the given ledger, starting from its head.
    pub fn new(sync: SyncConfig, pool: PoolConfig, ledger: Arc<dyn LedgerDelegate>) -> Self {
        let head = ledger.current_head();
        let capacity = sync.recent_cache_size;
        Self {
            sync,
            ledger,
            pool: SyncPool::new(pool),
            sessions: HashMap::new(),
            in_flight: HashMap::new(),
            view: LocalChainView::new(head, capacity),
        }
    }

    /// Wraps an engine for sharing across tasks.
    pub fn shared(self) -> SharedEngine {
        Arc::new(parking_lot::Mutex::new(self))
    }

    /// The local best head as the engine last observed it.
    pub fn local_head(&self) -> ChainHead {
        self.view.head
    }

    /// The delegate behind this engine. The apply worker clones it out so
    /// ledger batches run without the engine lock held.
    pub fn ledger(&self) -> Arc<dyn LedgerDelegate> {
        Arc::clone(&self.ledger)
    }

    /// Number of sync-eligible peers.
    pub fn pooled_peers(&self) -> usize {
        self.pool.len()
    }

    /// Snapshot for status logging.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            height: self.view.head.height,
            pooled_peers: self.pool.len(),
            in_flight: self.in_flight.len(),
        }
    }

    // -- Lifecycle ----------------------------------------------------------

    /// A connection finished its handshake. Attempts pool admission and, if
    /// eligible, opens a session and kicks off catch-up.
    pub fn peer_ready(&mut self, peer: PeerId, head: ChainHead, now: u64) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        match self.pool.admit(PoolEntry::new(peer, head, now)) {
            Admission::Admitted => {
                debug!(%peer, height = head.height, "peer admitted to sync pool");
                self.sessions.entry(peer).or_insert_with(|| SyncSession::new(peer));
            }
            Admission::Evicting(victim) => {
                info!(%peer, %victim, "pool full, evicting lowest-ranked peer");
                self.sessions.entry(peer).or_insert_with(|| SyncSession::new(peer));
                actions.push(SyncAction::Disconnect {
                    peer: victim,
                    reason: DisconnectReason::PoolFull,
                });
            }
            Admission::Rejected => {
                debug!(%peer, "pool full, peer not sync-eligible");
                return actions;
            }
        }
        self.try_start_sync(peer, now, &mut actions);
        actions
    }

    /// A connection is gone. Tears down the session, removes the pool entry,
    /// and releases every in-flight reservation held by the peer so other
    /// peers may serve those items. Idempotent: the second call finds
    /// nothing to clean up.
    pub fn peer_disconnected(&mut self, peer: PeerId, _now: u64) {
        if let Some(mut session) = self.sessions.remove(&peer) {
            let window = session.detach();
            debug!(%peer, released = window.len(), "session detached");
        }
        self.in_flight.retain(|_, request| request.peer != peer);
        self.pool.remove(peer);
    }

    // -- Message dispatch ---------------------------------------------------

    /// Dispatches one decoded message from a handshaked peer.
    pub fn handle_message(&mut self, peer: PeerId, message: Message, now: u64) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        trace!(%peer, kind = message.kind_name(), "dispatching message");
        match message {
            Message::Handshake { .. } => {
                // A second handshake is out of protocol.
                warn!(%peer, "handshake repeated after completion");
                actions.push(SyncAction::Disconnect {
                    peer,
                    reason: DisconnectReason::BadProtocol,
                });
            }
            Message::Disconnect { reason } => {
                debug!(%peer, ?reason, "peer announced disconnect");
                actions.push(SyncAction::Disconnect {
                    peer,
                    reason: DisconnectReason::Requested,
                });
            }
            Message::Inventory { kind, hashes } => {
                self.handle_inventory(peer, kind, hashes, now, &mut actions);
            }
            Message::GetInventory { from_height, limit } => {
                let limit = limit.min(self.sync.batch_limit);
                let hashes = self.ledger.block_hashes_after(from_height, limit);
                actions.push(SyncAction::Send {
                    peer,
                    message: Message::Inventory {
                        kind: ItemKind::Block,
                        hashes,
                    },
                });
            }
            Message::GetData { kind, hashes } => {
                self.handle_get_data(peer, kind, hashes, &mut actions);
            }
            Message::Blocks(blocks) => {
                self.handle_blocks(peer, blocks, now, &mut actions);
            }
            Message::Transactions(transactions) => {
                self.handle_transactions(peer, transactions, now, &mut actions);
            }
            Message::PeerExchange { addresses } => {
                if addresses.len() > config::MAX_EXCHANGED_ADDRESSES {
                    actions.push(SyncAction::Disconnect {
                        peer,
                        reason: DisconnectReason::BadProtocol,
                    });
                } else if !addresses.is_empty() {
                    actions.push(SyncAction::AddCandidates(addresses));
                }
            }
        }
        actions
    }

    fn handle_inventory(
        &mut self,
        peer: PeerId,
        kind: ItemKind,
        hashes: Vec<Hash>,
        now: u64,
        actions: &mut Vec<SyncAction>,
    ) {
        if hashes.len() > config::MAX_INVENTORY_HASHES {
            actions.push(SyncAction::Disconnect {
                peer,
                reason: DisconnectReason::BadProtocol,
            });
            return;
        }
        let Some(session) = self.sessions.get_mut(&peer) else {
            // Not sync-eligible; announcements from this peer are ignored.
            trace!(%peer, "inventory from peer without session");
            return;
        };
        for hash in &hashes {
            session.note_known(*hash);
        }

        // Everything we don't have, haven't just accepted, and haven't
        // already asked someone else for. A hash that is in flight to
        // another peer is deliberately *not* requested again — that peer's
        // announce was effectively answered with "not needed now".
        let wanted: Vec<Hash> = hashes
            .into_iter()
            .filter(|h| !self.view.seen_recently(h))
            .filter(|h| !self.in_flight.contains_key(h))
            .filter(|h| !self.ledger.has(&InventoryItem { kind, hash: *h }))
            .collect();

        let deadline = now + self.sync.request_timeout_ms;
        match kind {
            ItemKind::Transaction => {
                if wanted.is_empty() {
                    return;
                }
                for hash in &wanted {
                    self.in_flight.insert(
                        *hash,
                        InFlightRequest {
                            peer,
                            kind,
                            deadline,
                        },
                    );
                }
                actions.push(SyncAction::Send {
                    peer,
                    message: Message::GetData {
                        kind,
                        hashes: wanted,
                    },
                });
            }
            ItemKind::Block => {
                let session = self.sessions.get_mut(&peer).expect("session checked above");
                // A probe answer resolves the HeadExchanged phase first.
                let answered_probe = matches!(session.phase(), SyncPhase::HeadExchanged { .. });
                if answered_probe {
                    let probe_from = session.probe_answered().expect("phase checked");
                    trace!(%peer, probe_from, wanted = wanted.len(), "catch-up probe answered");
                }
                if wanted.is_empty() {
                    if answered_probe {
                        self.pool.clear_deadline(peer);
                    }
                    return;
                }
                if !session.is_idle() {
                    // Busy with an earlier batch; the known-set above is
                    // enough — these hashes can be fetched later or from
                    // someone else.
                    return;
                }
                for hash in &wanted {
                    self.in_flight.insert(
                        *hash,
                        InFlightRequest {
                            peer,
                            kind,
                            deadline,
                        },
                    );
                }
                session
                    .begin_request(wanted.clone(), deadline)
                    .expect("session is idle");
                self.pool.set_deadline(peer, deadline);
                actions.push(SyncAction::Send {
                    peer,
                    message: Message::GetData {
                        kind,
                        hashes: wanted,
                    },
                });
            }
        }
    }

    fn handle_get_data(
        &mut self,
        peer: PeerId,
        kind: ItemKind,
        hashes: Vec<Hash>,
        actions: &mut Vec<SyncAction>,
    ) {
        if hashes.len() > config::MAX_INVENTORY_HASHES {
            actions.push(SyncAction::Disconnect {
                peer,
                reason: DisconnectReason::BadProtocol,
            });
            return;
        }
        // Serve what we have in the requested order; hashes we lack are
        // silently skipped — a peer can legitimately differ in what it has.
        let message = match kind {
            ItemKind::Block => Message::Blocks(
                hashes
                    .iter()
                    .filter_map(|h| self.ledger.get_block(h))
                    .collect(),
            ),
            ItemKind::Transaction => Message::Transactions(
                hashes
                    .iter()
                    .filter_map(|h| self.ledger.get_transaction(h))
                    .collect(),
            ),
        };
        // Always answer, even with nothing: the requester's window should
        // resolve rather than ride out its deadline.
        actions.push(SyncAction::Send { peer, message });
    }

    fn handle_blocks(
        &mut self,
        peer: PeerId,
        blocks: Vec<crate::chain::Block>,
        _now: u64,
        actions: &mut Vec<SyncAction>,
    ) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            trace!(%peer, "blocks from peer without session");
            return;
        };
        if session.begin_applying().is_err() {
            // Most likely a response that arrived after its deadline
            // already cancelled the window. Stale, not malicious.
            debug!(%peer, count = blocks.len(), "unsolicited or late blocks ignored");
            return;
        }
        // Payloads must be a subsequence of the requested window, in
        // request order. Anything else is the peer making things up.
        let window = session.window().expect("session is applying");
        let mut cursor = 0usize;
        let mut ordered = true;
        for block in &blocks {
            match window[cursor..].iter().position(|h| *h == block.hash) {
                Some(offset) => cursor += offset + 1,
                None => {
                    ordered = false;
                    break;
                }
            }
        }
        if !ordered {
            warn!(%peer, "blocks outside the requested window");
            actions.push(SyncAction::Disconnect {
                peer,
                reason: DisconnectReason::BadProtocol,
            });
            return;
        }
        // The answer is in hand; the peer is off the clock. The ledger
        // runs on the apply worker, not under this lock, and the outcomes
        // come back through `batch_applied`.
        self.pool.clear_deadline(peer);
        actions.push(SyncAction::Apply {
            peer,
            items: blocks.into_iter().map(LedgerItem::Block).collect(),
        });
    }

    fn handle_transactions(
        &mut self,
        peer: PeerId,
        transactions: Vec<crate::chain::Transaction>,
        _now: u64,
        actions: &mut Vec<SyncAction>,
    ) {
        if !self.sessions.contains_key(&peer) {
            trace!(%peer, "transactions from peer without session");
            return;
        }
        let mut items = Vec::with_capacity(transactions.len());
        for tx in transactions {
            let hash = tx.id;
            if self.view.seen_recently(&hash) {
                // Already accepted. The duplicate delivery resolves this
                // peer's own reservation and nobody else's.
                self.release_if_held(&hash, peer);
                continue;
            }
            items.push(LedgerItem::Transaction(tx));
        }
        if items.is_empty() {
            return;
        }
        actions.push(SyncAction::Apply { peer, items });
    }

    /// Commits the outcomes of a batch the apply worker ran through the
    /// ledger: bookkeeping, scoring, fan-out, and the next catch-up step.
    /// The peer may have disconnected while the batch was in the queue;
    /// accepted items still count, session bookkeeping is skipped.
    pub fn batch_applied(
        &mut self,
        peer: PeerId,
        outcomes: Vec<(InventoryItem, ApplyOutcome)>,
        now: u64,
    ) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        let mut accepted_blocks = Vec::new();
        let mut accepted_txs = Vec::new();
        let mut any_block = false;
        for (inventory, outcome) in outcomes {
            let hash = inventory.hash;
            any_block |= inventory.kind == ItemKind::Block;
            match outcome {
                ApplyOutcome::Accepted => {
                    self.release_if_held(&hash, peer);
                    self.view.note_recent(hash);
                    match inventory.kind {
                        ItemKind::Block => accepted_blocks.push(hash),
                        ItemKind::Transaction => accepted_txs.push(hash),
                    }
                    if let Some(session) = self.sessions.get_mut(&peer) {
                        session.score.record_delivered();
                        session.note_known(hash);
                        self.pool.mark_useful(peer, now);
                    }
                }
                ApplyOutcome::AlreadyPresent => {
                    self.release_if_held(&hash, peer);
                    self.view.note_recent(hash);
                }
                ApplyOutcome::Rejected(reason) => {
                    info!(%peer, hash = %short_hash(&hash), %reason, "ledger rejected item");
                    self.release_if_held(&hash, peer);
                    if let Some(session) = self.sessions.get_mut(&peer) {
                        session.score.record_invalid();
                    }
                }
            }
        }

        if !accepted_blocks.is_empty() {
            self.view.head = self.ledger.current_head();
            info!(
                %peer,
                accepted = accepted_blocks.len(),
                height = self.view.head.height,
                "applied block batch"
            );
        }

        // Release reservations for anything in the window that was not
        // resolved (the peer lacked it, or the batch was cut short).
        let mut spent_window = Vec::new();
        if any_block {
            if let Some(session) = self.sessions.get_mut(&peer) {
                match session.finish_applying() {
                    Ok(window) => spent_window = window,
                    Err(error) => debug!(%peer, %error, "batch outcome without a window"),
                }
            }
        }
        for hash in &spent_window {
            self.release_if_held(hash, peer);
        }
        if let Some(session) = self.sessions.get(&peer) {
            let score = session.score.value();
            self.pool.update_score(peer, score);
        }

        self.announce_to_pool(Some(peer), ItemKind::Block, &accepted_blocks, &mut actions);
        self.announce_to_pool(Some(peer), ItemKind::Transaction, &accepted_txs, &mut actions);

        // Keep pulling: from the same peer if it is still ahead, otherwise
        // from the best-ranked idle peer that is.
        self.try_start_sync(peer, now, &mut actions);
        if let Some(best) = self.pool.best(self.view.head.height) {
            self.try_start_sync(best, now, &mut actions);
        }
        actions
    }

    // -- Broadcast entry points --------------------------------------------

    /// Announces a locally produced block to every pooled peer that has not
    /// already announced it to us. Called by the block-production service
    /// after the ledger has committed the block.
    pub fn broadcast_block(&mut self, head: ChainHead, _now: u64) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        self.view.head = self.ledger.current_head();
        self.view.note_recent(head.hash);
        self.announce_to_pool(None, ItemKind::Block, &[head.hash], &mut actions);
        actions
    }

    /// Announces a locally submitted transaction the same way.
    pub fn broadcast_transaction(&mut self, id: Hash, _now: u64) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        self.view.note_recent(id);
        self.announce_to_pool(None, ItemKind::Transaction, &[id], &mut actions);
        actions
    }

    // -- Periodic maintenance ----------------------------------------------

    /// Deadline sweep plus sync scheduling. Runs on an interval; expiry here
    /// is the *only* place request timeouts are detected, so a silent peer
    /// costs one sweep of latency, never a hung session.
    pub fn tick(&mut self, now: u64) -> Vec<SyncAction> {
        let mut actions = Vec::new();

        // One timeout event per peer per sweep — a batch shares one
        // deadline, and a late transaction plus a late probe is still one
        // case of silence.
        let mut timed_out: HashSet<PeerId> = HashSet::new();

        // Expired transaction reservations. Block reservations share their
        // session window's deadline and are settled with the session below,
        // so an old transaction reservation never tears down a window that
        // is still on time.
        self.in_flight.retain(|_, request| {
            if request.kind == ItemKind::Transaction && request.deadline <= now {
                timed_out.insert(request.peer);
                false
            } else {
                true
            }
        });

        // Sessions whose outstanding probe or batch missed its deadline.
        let expired_sessions: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, session)| {
                session
                    .outstanding_deadline()
                    .is_some_and(|deadline| deadline <= now)
            })
            .map(|(peer, _)| *peer)
            .collect();
        for peer in expired_sessions {
            let Some(session) = self.sessions.get_mut(&peer) else {
                continue;
            };
            let window = session.cancel_outstanding();
            for hash in window {
                self.release_if_held(&hash, peer);
            }
            self.pool.clear_deadline(peer);
            timed_out.insert(peer);
        }

        for peer in timed_out {
            let Some(session) = self.sessions.get_mut(&peer) else {
                continue;
            };
            session.score.record_timeout();
            let score = session.score.value();
            let strikes = session.score.consecutive_timeouts;
            self.pool.update_score(peer, score);
            debug!(%peer, score, strikes, "request deadline expired");

            if strikes >= self.sync.max_consecutive_timeouts {
                warn!(%peer, strikes, "peer unresponsive, disconnecting");
                actions.push(SyncAction::Disconnect {
                    peer,
                    reason: DisconnectReason::Unresponsive,
                });
            }
        }

        // Drive catch-up on idle peers, best-ranked first. Stale entries
        // surfacing here (deadline passed but no session cleanup — cannot
        // normally happen) go to the manager.
        let selection = self.pool.select(self.sync.parallel_fanout, now);
        for peer in selection.stale {
            actions.push(SyncAction::Disconnect {
                peer,
                reason: DisconnectReason::Unresponsive,
            });
        }
        for peer in selection.selected {
            self.try_start_sync(peer, now, &mut actions);
        }
        actions
    }

    // -- Internals ----------------------------------------------------------

    /// Releases the reservation for `hash` only if `peer` holds it. A
    /// delivery or expiry must never clear a reservation another peer is
    /// serving, or the same item could end up requested twice.
    fn release_if_held(&mut self, hash: &Hash, peer: PeerId) {
        if self
            .in_flight
            .get(hash)
            .is_some_and(|request| request.peer == peer)
        {
            self.in_flight.remove(hash);
        }
    }

    /// If `peer` is idle and advertises a head above ours, sends the next
    /// catch-up probe.
    fn try_start_sync(&mut self, peer: PeerId, now: u64, actions: &mut Vec<SyncAction>) {
        let local_height = self.view.head.height;
        let Some(head) = self.pool.head_of(peer) else {
            return;
        };
        if head.height <= local_height {
            return;
        }
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        if !session.is_idle() {
            return;
        }
        let from_height = local_height + 1;
        let deadline = now + self.sync.request_timeout_ms;
        session
            .begin_probe(from_height, deadline)
            .expect("session is idle");
        self.pool.set_deadline(peer, deadline);
        trace!(%peer, from_height, "requesting catch-up inventory");
        actions.push(SyncAction::Send {
            peer,
            message: Message::GetInventory {
                from_height,
                limit: self.sync.batch_limit,
            },
        });
    }

    /// Sends `Inventory { kind, hashes }` to every pooled peer (except
    /// `source`) that has not already announced any of the hashes to us,
    /// and remembers the announce so it is never repeated.
    fn announce_to_pool(
        &mut self,
        source: Option<PeerId>,
        kind: ItemKind,
        hashes: &[Hash],
        actions: &mut Vec<SyncAction>,
    ) {
        if hashes.is_empty() {
            return;
        }
        for peer in self.pool.peers_ranked() {
            if Some(peer) == source {
                continue;
            }
            let Some(session) = self.sessions.get_mut(&peer) else {
                continue;
            };
            let fresh: Vec<Hash> = hashes
                .iter()
                .copied()
                .filter(|h| !session.knows(h))
                .collect();
            if fresh.is_empty() {
                continue;
            }
            for hash in &fresh {
                session.note_known(*hash);
            }
            actions.push(SyncAction::Send {
                peer,
                message: Message::Inventory {
                    kind,
                    hashes: fresh,
                },
            });
        }
    }

    /// Test-only visibility into the in-flight map.
    #[cfg(test)]
    fn in_flight_holder(&self, hash: &Hash) -> Option<PeerId> {
        self.in_flight.get(hash).map(|r| r.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Block, Transaction};
    use crate::ledger::MemoryLedger;

    const T0: u64 = 1_000_000;

    /// Engine over a fresh in-memory ledger, with a tight pool if asked.
    fn make_engine(pool_capacity: usize) -> (SyncEngine, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let engine = SyncEngine::new(
            SyncConfig::default(),
            PoolConfig {
                capacity: pool_capacity,
            },
            Arc::clone(&ledger) as Arc<dyn LedgerDelegate>,
        );
        (engine, ledger)
    }

    /// A chain of `count` empty blocks on top of genesis (genesis included).
    fn make_chain(count: usize) -> Vec<Block> {
        let mut chain = vec![Block::genesis()];
        for _ in 0..count {
            let parent = chain.last().unwrap().head();
            chain.push(Block::new(&parent, vec![]));
        }
        chain
    }

    fn head_of(chain: &[Block]) -> ChainHead {
        chain.last().unwrap().head()
    }

    fn sent_to(actions: &[SyncAction], peer: PeerId) -> Vec<&Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                SyncAction::Send { peer: p, message } if *p == peer => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Stands in for the node's apply worker: runs `Apply` actions through
    /// the ledger and commits the outcomes, passing everything else through.
    fn drive(
        engine: &mut SyncEngine,
        ledger: &MemoryLedger,
        actions: Vec<SyncAction>,
        now: u64,
    ) -> Vec<SyncAction> {
        let mut out = Vec::new();
        for action in actions {
            match action {
                SyncAction::Apply { peer, items } => {
                    let outcomes = apply_batch(ledger, items);
                    out.extend(engine.batch_applied(peer, outcomes, now));
                }
                other => out.push(other),
            }
        }
        out
    }

    // -- Catch-up -----------------------------------------------------------

    #[test]
    fn catch_up_advances_head_and_announces_to_others() {
        let (mut engine, ledger) = make_engine(10);
        let chain = make_chain(5);
        let peer_a = PeerId::for_test(1);
        let peer_b = PeerId::for_test(2);

        // Peer B is pooled but at our height; peer A is 5 blocks ahead.
        engine.peer_ready(peer_b, ChainHead::genesis(), T0);
        let actions = engine.peer_ready(peer_a, head_of(&chain), T0);

        // Probe for heights we lack.
        assert_eq!(
            sent_to(&actions, peer_a),
            vec![&Message::GetInventory {
                from_height: 1,
                limit: config::SYNC_BATCH_LIMIT,
            }]
        );

        // A answers with the hashes; engine requests the payloads.
        let hashes: Vec<Hash> = chain[1..].iter().map(|b| b.hash).collect();
        let actions = engine.handle_message(
            peer_a,
            Message::Inventory {
                kind: ItemKind::Block,
                hashes: hashes.clone(),
            },
            T0 + 10,
        );
        assert_eq!(
            sent_to(&actions, peer_a),
            vec![&Message::GetData {
                kind: ItemKind::Block,
                hashes: hashes.clone(),
            }]
        );
        for hash in &hashes {
            assert_eq!(engine.in_flight_holder(hash), Some(peer_a));
        }

        // A delivers; the head advances and B hears about the new blocks.
        let actions =
            engine.handle_message(peer_a, Message::Blocks(chain[1..].to_vec()), T0 + 20);
        let actions = drive(&mut engine, &ledger, actions, T0 + 20);
        assert_eq!(engine.local_head().height, 5);
        assert_eq!(engine.local_head().hash, chain[5].hash);
        assert_eq!(
            sent_to(&actions, peer_b),
            vec![&Message::Inventory {
                kind: ItemKind::Block,
                hashes: hashes.clone(),
            }]
        );
        // Nothing is announced back to the peer that delivered.
        assert!(sent_to(&actions, peer_a)
            .iter()
            .all(|m| !matches!(m, Message::Inventory { .. })));
        // All reservations resolved.
        for hash in &hashes {
            assert_eq!(engine.in_flight_holder(hash), None);
        }
    }

    #[test]
    fn blocks_are_applied_outside_the_dispatch_path() {
        let (mut engine, ledger) = make_engine(10);
        let chain = make_chain(2);
        let peer = PeerId::for_test(1);

        engine.peer_ready(peer, head_of(&chain), T0);
        let hashes: Vec<Hash> = chain[1..].iter().map(|b| b.hash).collect();
        engine.handle_message(
            peer,
            Message::Inventory {
                kind: ItemKind::Block,
                hashes,
            },
            T0,
        );

        // Dispatch only checks the window and hands the batch off; the
        // ledger is untouched until the outcomes are committed.
        let actions = engine.handle_message(peer, Message::Blocks(chain[1..].to_vec()), T0 + 5);
        assert!(matches!(
            actions.as_slice(),
            [SyncAction::Apply { peer: p, items }] if *p == peer && items.len() == 2
        ));
        assert_eq!(ledger.current_head().height, 0);
        assert_eq!(engine.local_head().height, 0);

        drive(&mut engine, &ledger, actions, T0 + 5);
        assert_eq!(ledger.current_head().height, 2);
        assert_eq!(engine.local_head().height, 2);
    }

    #[test]
    fn commit_probes_the_best_idle_peer_when_still_behind() {
        let (mut engine, ledger) = make_engine(10);
        let chain = make_chain(6);
        let peer_a = PeerId::for_test(1);
        let peer_b = PeerId::for_test(2);

        // A is 3 ahead of us, B is 6 ahead; both get probed on admission.
        engine.peer_ready(peer_a, chain[3].head(), T0);
        engine.peer_ready(peer_b, head_of(&chain), T0);

        let first_three: Vec<Hash> = chain[1..4].iter().map(|b| b.hash).collect();
        engine.handle_message(
            peer_a,
            Message::Inventory {
                kind: ItemKind::Block,
                hashes: first_three.clone(),
            },
            T0 + 1,
        );
        // B's probe answer offers nothing that is not already in flight to
        // A, so B drops back to idle.
        engine.handle_message(
            peer_b,
            Message::Inventory {
                kind: ItemKind::Block,
                hashes: first_three,
            },
            T0 + 2,
        );

        // A's batch lands and A is exhausted; the commit immediately turns
        // to the best idle peer that is still ahead instead of waiting for
        // the next sweep.
        let actions = engine.handle_message(peer_a, Message::Blocks(chain[1..4].to_vec()), T0 + 3);
        let actions = drive(&mut engine, &ledger, actions, T0 + 3);
        assert_eq!(engine.local_head().height, 3);
        assert!(sent_to(&actions, peer_b).iter().any(|m| matches!(
            m,
            Message::GetInventory { from_height: 4, .. }
        )));
    }

    #[test]
    fn rejected_block_discards_the_rest_of_the_batch() {
        let (mut engine, ledger) = make_engine(10);
        let chain = make_chain(3);
        let peer = PeerId::for_test(1);

        engine.peer_ready(peer, head_of(&chain), T0);
        let hashes: Vec<Hash> = chain[1..].iter().map(|b| b.hash).collect();
        engine.handle_message(
            peer,
            Message::Inventory {
                kind: ItemKind::Block,
                hashes,
            },
            T0,
        );

        // Deliver block 2 without block 1: a legal subsequence of the
        // window, but the ledger rejects the detached block.
        let detached = vec![chain[2].clone()];
        let actions = engine.handle_message(peer, Message::Blocks(detached), T0 + 10);
        let actions = drive(&mut engine, &ledger, actions, T0 + 10);

        assert_eq!(engine.local_head().height, 0);
        // Ledger rejection is not a disconnect offence.
        assert!(actions
            .iter()
            .all(|a| !matches!(a, SyncAction::Disconnect { .. })));
        // The peer paid for it in score.
        assert!(engine.sessions[&peer].score.invalid >= 1);
    }

    #[test]
    fn blocks_outside_the_window_are_a_protocol_violation() {
        let (mut engine, _ledger) = make_engine(10);
        let chain = make_chain(2);
        let peer = PeerId::for_test(1);

        engine.peer_ready(peer, head_of(&chain), T0);
        engine.handle_message(
            peer,
            Message::Inventory {
                kind: ItemKind::Block,
                hashes: vec![chain[1].hash],
            },
            T0,
        );

        // Delivering a block we never asked this peer for.
        let actions = engine.handle_message(peer, Message::Blocks(vec![chain[2].clone()]), T0);
        assert!(actions.contains(&SyncAction::Disconnect {
            peer,
            reason: DisconnectReason::BadProtocol,
        }));
    }

    // -- Duplicate suppression ---------------------------------------------

    #[test]
    fn second_announcer_is_not_asked() {
        let (mut engine, _ledger) = make_engine(10);
        let peer_a = PeerId::for_test(1);
        let peer_b = PeerId::for_test(2);
        engine.peer_ready(peer_a, ChainHead::genesis(), T0);
        engine.peer_ready(peer_b, ChainHead::genesis(), T0);

        let tx = Transaction::new(b"pay".to_vec());
        let announce = Message::Inventory {
            kind: ItemKind::Transaction,
            hashes: vec![tx.id],
        };

        let actions = engine.handle_message(peer_a, announce.clone(), T0);
        assert_eq!(sent_to(&actions, peer_a).len(), 1);
        assert_eq!(engine.in_flight_holder(&tx.id), Some(peer_a));

        // B offers the same hash while A's request is outstanding: no
        // second GetData goes out, anywhere.
        let actions = engine.handle_message(peer_b, announce, T0 + 5);
        assert!(actions.is_empty());
        assert_eq!(engine.in_flight_holder(&tx.id), Some(peer_a));
    }

    #[test]
    fn rejected_delivery_keeps_anothers_reservation() {
        let (mut engine, ledger) = make_engine(10);
        let peer_a = PeerId::for_test(1);
        let peer_b = PeerId::for_test(2);
        let peer_c = PeerId::for_test(3);
        engine.peer_ready(peer_a, ChainHead::genesis(), T0);
        engine.peer_ready(peer_b, ChainHead::genesis(), T0);
        engine.peer_ready(peer_c, ChainHead::genesis(), T0);

        let tx = Transaction::new(b"real".to_vec());
        let announce = Message::Inventory {
            kind: ItemKind::Transaction,
            hashes: vec![tx.id],
        };
        engine.handle_message(peer_a, announce.clone(), T0);
        assert_eq!(engine.in_flight_holder(&tx.id), Some(peer_a));

        // B pushes a forgery claiming the id A is serving; the ledger
        // rejects it on the id check.
        let forged = Transaction {
            id: tx.id,
            payload: b"garbage".to_vec(),
        };
        let actions = engine.handle_message(peer_b, Message::Transactions(vec![forged]), T0 + 1);
        drive(&mut engine, &ledger, actions, T0 + 1);
        assert!(engine.sessions[&peer_b].score.invalid >= 1);

        // A's reservation survives, so C's announce stays a duplicate and
        // no second GetData goes out for the same item.
        assert_eq!(engine.in_flight_holder(&tx.id), Some(peer_a));
        let actions = engine.handle_message(peer_c, announce, T0 + 2);
        assert!(actions.is_empty());
    }

    #[test]
    fn known_items_are_not_requested_at_all() {
        let (mut engine, ledger) = make_engine(10);
        let peer = PeerId::for_test(1);
        engine.peer_ready(peer, ChainHead::genesis(), T0);

        let tx = Transaction::new(b"dup".to_vec());
        ledger.validate_and_apply(LedgerItem::Transaction(tx.clone()));

        let actions = engine.handle_message(
            peer,
            Message::Inventory {
                kind: ItemKind::Transaction,
                hashes: vec![tx.id],
            },
            T0,
        );
        assert!(actions.is_empty());
    }

    // -- Timeouts -----------------------------------------------------------

    #[test]
    fn timeout_penalizes_and_frees_the_range() {
        let (mut engine, _ledger) = make_engine(10);
        let chain = make_chain(3);
        let peer_b = PeerId::for_test(1);
        let peer_c = PeerId::for_test(2);

        engine.peer_ready(peer_b, head_of(&chain), T0);
        engine.peer_ready(peer_c, head_of(&chain), T0);

        // B gets the probe first (both idle, B admitted first).
        let hashes: Vec<Hash> = chain[1..].iter().map(|b| b.hash).collect();
        engine.handle_message(
            peer_b,
            Message::Inventory {
                kind: ItemKind::Block,
                hashes: hashes.clone(),
            },
            T0,
        );
        assert_eq!(engine.in_flight_holder(&hashes[0]), Some(peer_b));

        // B never answers. Past the deadline, the sweep penalizes B and
        // releases every reservation.
        let late = T0 + config::REQUEST_TIMEOUT.as_millis() as u64 + 1;
        engine.tick(late);

        assert_eq!(engine.sessions[&peer_b].score.timeouts, 1);
        assert!(engine.sessions[&peer_b].score.value() < 0);
        for hash in &hashes {
            assert_eq!(engine.in_flight_holder(hash), None);
        }
        // Nothing was marked applied.
        assert_eq!(engine.local_head().height, 0);

        // The same hashes are now requestable from C.
        let actions = engine.handle_message(
            peer_c,
            Message::Inventory {
                kind: ItemKind::Block,
                hashes: hashes.clone(),
            },
            late,
        );
        assert_eq!(
            sent_to(&actions, peer_c),
            vec![&Message::GetData {
                kind: ItemKind::Block,
                hashes,
            }]
        );
    }

    #[test]
    fn expired_tx_reservation_spares_a_live_block_window() {
        let (mut engine, ledger) = make_engine(10);
        let chain = make_chain(3);
        let peer = PeerId::for_test(1);
        let timeout = config::REQUEST_TIMEOUT.as_millis() as u64;

        engine.peer_ready(peer, head_of(&chain), T0);

        // A transaction request goes out early...
        let tx = Transaction::new(b"slow".to_vec());
        engine.handle_message(
            peer,
            Message::Inventory {
                kind: ItemKind::Transaction,
                hashes: vec![tx.id],
            },
            T0 + 5,
        );
        // ...and the probe answer arrives much later, opening a block
        // window whose deadline is far beyond the transaction's.
        let hashes: Vec<Hash> = chain[1..].iter().map(|b| b.hash).collect();
        engine.handle_message(
            peer,
            Message::Inventory {
                kind: ItemKind::Block,
                hashes: hashes.clone(),
            },
            T0 + 15_000,
        );

        // Sweep after the transaction deadline: only that reservation
        // expires. The window is still on time and stays reserved.
        let actions = engine.tick(T0 + timeout + 6);
        assert!(actions
            .iter()
            .all(|a| !matches!(a, SyncAction::Disconnect { .. })));
        assert_eq!(engine.in_flight_holder(&tx.id), None);
        for hash in &hashes {
            assert_eq!(engine.in_flight_holder(hash), Some(peer));
        }
        assert_eq!(engine.sessions[&peer].score.timeouts, 1);

        // The delivery still applies normally.
        let actions =
            engine.handle_message(peer, Message::Blocks(chain[1..].to_vec()), T0 + timeout + 10);
        drive(&mut engine, &ledger, actions, T0 + timeout + 10);
        assert_eq!(engine.local_head().height, 3);
    }

    #[test]
    fn repeated_timeouts_disconnect_the_peer() {
        let (mut engine, _ledger) = make_engine(10);
        let peer = PeerId::for_test(1);
        let chain = make_chain(2);
        engine.peer_ready(peer, head_of(&chain), T0);

        let timeout = config::REQUEST_TIMEOUT.as_millis() as u64;
        let mut now = T0;
        for strike in 1..=config::MAX_CONSECUTIVE_TIMEOUTS {
            // The tick reschedules a probe for the still-ahead peer, which
            // then times out on the next sweep.
            now += timeout + 1;
            let actions = engine.tick(now);
            if strike == config::MAX_CONSECUTIVE_TIMEOUTS {
                assert!(actions.contains(&SyncAction::Disconnect {
                    peer,
                    reason: DisconnectReason::Unresponsive,
                }));
            } else {
                assert!(actions
                    .iter()
                    .all(|a| !matches!(a, SyncAction::Disconnect { .. })));
            }
        }
    }

    // -- Disconnect hygiene -------------------------------------------------

    #[test]
    fn disconnect_releases_in_flight_reservations() {
        let (mut engine, _ledger) = make_engine(10);
        let chain = make_chain(4);
        let peer = PeerId::for_test(1);
        engine.peer_ready(peer, head_of(&chain), T0);

        let hashes: Vec<Hash> = chain[1..].iter().map(|b| b.hash).collect();
        engine.handle_message(
            peer,
            Message::Inventory {
                kind: ItemKind::Block,
                hashes: hashes.clone(),
            },
            T0,
        );
        assert!(hashes
            .iter()
            .all(|h| engine.in_flight_holder(h) == Some(peer)));

        engine.peer_disconnected(peer, T0 + 1);
        assert!(hashes.iter().all(|h| engine.in_flight_holder(h).is_none()));
        assert_eq!(engine.pooled_peers(), 0);
        assert!(!engine.sessions.contains_key(&peer));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (mut engine, _ledger) = make_engine(10);
        let peer = PeerId::for_test(1);
        engine.peer_ready(peer, ChainHead::genesis(), T0);

        engine.peer_disconnected(peer, T0);
        let status = engine.status();
        engine.peer_disconnected(peer, T0);
        assert_eq!(engine.status(), status);
    }

    // -- Admission ----------------------------------------------------------

    #[test]
    fn full_pool_evicts_via_disconnect_action() {
        let (mut engine, _ledger) = make_engine(1);
        let veteran = PeerId::for_test(1);
        let newcomer = PeerId::for_test(2);

        engine.peer_ready(veteran, ChainHead::genesis(), T0);
        // Sink the veteran's score so the newcomer outranks it.
        engine
            .sessions
            .get_mut(&veteran)
            .unwrap()
            .score
            .record_invalid();
        let score = engine.sessions[&veteran].score.value();
        engine.pool.update_score(veteran, score);

        let actions = engine.peer_ready(newcomer, ChainHead::genesis(), T0 + 10);
        assert!(actions.contains(&SyncAction::Disconnect {
            peer: veteran,
            reason: DisconnectReason::PoolFull,
        }));
        assert!(engine.pool.contains(newcomer));
    }

    #[test]
    fn worse_newcomer_is_rejected_but_not_disconnected() {
        let (mut engine, _ledger) = make_engine(1);
        let veteran = PeerId::for_test(1);
        let newcomer = PeerId::for_test(2);

        engine.peer_ready(veteran, ChainHead::genesis(), T0);
        // Equal score: the veteran's seniority (earlier joined_at) wins.
        let actions = engine.peer_ready(newcomer, ChainHead::genesis(), T0 + 10);

        assert!(actions.is_empty());
        assert!(engine.pool.contains(veteran));
        assert!(!engine.pool.contains(newcomer));
        // The rejected peer has no session but stays connected.
        assert!(!engine.sessions.contains_key(&newcomer));
    }

    // -- Serving ------------------------------------------------------------

    #[test]
    fn serves_inventory_and_data_requests() {
        let (mut engine, ledger) = make_engine(10);
        let chain = make_chain(3);
        for block in &chain[1..] {
            ledger.validate_and_apply(LedgerItem::Block(block.clone()));
        }
        let peer = PeerId::for_test(1);
        engine.peer_ready(peer, ChainHead::genesis(), T0);

        let actions = engine.handle_message(
            peer,
            Message::GetInventory {
                from_height: 1,
                limit: 10,
            },
            T0,
        );
        assert_eq!(
            sent_to(&actions, peer),
            vec![&Message::Inventory {
                kind: ItemKind::Block,
                hashes: chain[1..].iter().map(|b| b.hash).collect(),
            }]
        );

        let actions = engine.handle_message(
            peer,
            Message::GetData {
                kind: ItemKind::Block,
                hashes: vec![chain[2].hash, [0xEE; 32]],
            },
            T0,
        );
        // The unknown hash is skipped, not an error.
        assert_eq!(
            sent_to(&actions, peer),
            vec![&Message::Blocks(vec![chain[2].clone()])]
        );
    }

    // -- Broadcast ----------------------------------------------------------

    #[test]
    fn produced_blocks_fan_out_once() {
        let (mut engine, ledger) = make_engine(10);
        let peer_a = PeerId::for_test(1);
        let peer_b = PeerId::for_test(2);
        engine.peer_ready(peer_a, ChainHead::genesis(), T0);
        engine.peer_ready(peer_b, ChainHead::genesis(), T0);

        let block = Block::new(&ChainHead::genesis(), vec![]);
        ledger.validate_and_apply(LedgerItem::Block(block.clone()));

        let actions = engine.broadcast_block(block.head(), T0);
        assert_eq!(sent_to(&actions, peer_a).len(), 1);
        assert_eq!(sent_to(&actions, peer_b).len(), 1);
        assert_eq!(engine.local_head().height, 1);

        // Announcing again reaches nobody — everyone already knows.
        let actions = engine.broadcast_block(block.head(), T0 + 1);
        assert!(actions.is_empty());
    }

    #[test]
    fn peer_exchange_feeds_the_connector() {
        let (mut engine, _ledger) = make_engine(10);
        let peer = PeerId::for_test(1);
        engine.peer_ready(peer, ChainHead::genesis(), T0);

        let addr: SocketAddr = "10.0.0.7:9650".parse().unwrap();
        let actions = engine.handle_message(
            peer,
            Message::PeerExchange {
                addresses: vec![addr],
            },
            T0,
        );
        assert_eq!(actions, vec![SyncAction::AddCandidates(vec![addr])]);
    }
}

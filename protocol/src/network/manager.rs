//! # Connection Manager
//!
//! Owner of every live socket. The manager accepts inbound connections,
//! dials outbound ones, runs the handshake gate, and registers the
//! survivors in its peer table. Nothing else in the crate ever touches a
//! transport handle — the sync engine speaks in [`PeerId`]s and
//! [`SyncAction`]s, and the manager translates both ways.
//!
//! ## Per-connection tasks
//!
//! Each registered connection gets two tokio tasks: a reader that decodes
//! frames and feeds them to the engine, and a writer that drains an mpsc
//! queue onto the socket. Disconnect is a single table removal: the handle
//! drop closes the writer's queue (after a best-effort goodbye frame) and
//! trips the reader's close signal. Both tasks exit on their own; calling
//! [`ConnectionManager::disconnect`] twice is harmless.
//!
//! One more task serves the whole manager: the apply worker. Received
//! batches leave the engine as [`SyncAction::Apply`] and queue onto a
//! bounded channel; the worker runs the ledger on the blocking pool and
//! commits the outcomes. Frame dispatch for every other peer keeps moving
//! while a batch is being validated.
//!
//! ## Handshake gate
//!
//! Both sides send their `Handshake` frame immediately — no
//! initiator/responder asymmetry. A connection that fails any check
//! (version, duplicate identity, self-dial, caps) gets a `Disconnect`
//! reason frame where possible and never reaches the peer table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::chain::Hash;
use crate::config;
use crate::ledger::LedgerItem;
use crate::network::connector::CandidateBook;
use crate::network::engine::{apply_batch, SharedEngine, SyncAction};
use crate::network::peer::{Direction, PeerId, PeerInfo};
use crate::network::unix_ms;
use crate::network::wire::{
    read_frame, write_frame, DisconnectReason, FrameError, Message,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection-layer tunables plus this node's own wire identity.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Random per-process identity, exchanged in the handshake.
    pub node_id: Hash,
    /// Port our own listener accepts connections on.
    pub listen_port: u16,
    /// Wire protocol version we speak.
    pub protocol_version: u16,
    /// Cap on simultaneous connections, both directions combined.
    pub max_connections: usize,
    /// Cap on simultaneous connections from one IP address.
    pub max_connections_per_ip: usize,
    /// How long a fresh connection may take to complete the handshake.
    pub handshake_timeout: Duration,
}

impl ConnectionConfig {
    /// Config with a freshly minted node identity.
    pub fn new(listen_port: u16) -> Self {
        Self {
            node_id: rand::random(),
            listen_port,
            protocol_version: config::WIRE_PROTOCOL_VERSION,
            max_connections: config::MAX_CONNECTIONS,
            max_connections_per_ip: config::MAX_CONNECTIONS_PER_IP,
            handshake_timeout: config::HANDSHAKE_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a connection never made it past the handshake gate.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer speaks a different wire version.
    #[error("peer wire version {theirs} incompatible with ours ({ours})")]
    IncompatibleVersion {
        /// Our version.
        ours: u16,
        /// The version the peer advertised.
        theirs: u16,
    },
    /// We already hold a connection to this node identity.
    #[error("duplicate connection to known node identity")]
    DuplicatePeer,
    /// The remote identity is our own — we dialed ourselves.
    #[error("connected to our own listener")]
    SelfConnection,
    /// Global or per-IP connection cap exceeded.
    #[error("connection limit reached")]
    TooManyPeers,
    /// The peer did not complete the handshake in time.
    #[error("handshake timed out")]
    Timeout,
    /// The first frame was not a handshake.
    #[error("expected handshake, got {0}")]
    UnexpectedMessage(&'static str),
    /// The peer closed the connection during the handshake.
    #[error("peer closed connection during handshake")]
    ClosedEarly,
    /// Framing or transport failure during the handshake.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl HandshakeError {
    /// The reason frame we owe the peer for this failure, when sending one
    /// is still possible.
    fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            Self::IncompatibleVersion { .. } => Some(DisconnectReason::IncompatibleVersion),
            Self::DuplicatePeer | Self::SelfConnection => Some(DisconnectReason::DuplicatePeer),
            Self::TooManyPeers => Some(DisconnectReason::TooManyPeers),
            Self::UnexpectedMessage(_) => Some(DisconnectReason::BadProtocol),
            Self::Timeout | Self::ClosedEarly | Self::Frame(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// Outbound message queue depth per connection. Backpressure beyond this
/// drops the message; the deadline machinery recovers the loss.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Apply queue depth, shared by all peers. A full queue makes the sender's
/// reader task wait — backpressure on the peers that deliver fastest.
const APPLY_QUEUE_DEPTH: usize = 16;

/// One received batch waiting for the ledger.
struct ApplyJob {
    peer: PeerId,
    items: Vec<LedgerItem>,
}

/// Everything the manager keeps per live connection. Dropping the handle
/// tears the connection down: the writer sees its queue close, the reader
/// sees the close signal drop.
struct ConnectionHandle {
    info: PeerInfo,
    outbound: mpsc::Sender<Message>,
    close: watch::Sender<bool>,
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// The socket owner. Shared as `Arc<ConnectionManager>` between the accept
/// loop, the dialer, per-connection tasks, and the tick driver.
pub struct ConnectionManager {
    config: ConnectionConfig,
    engine: SharedEngine,
    candidates: Arc<CandidateBook>,
    table: DashMap<PeerId, ConnectionHandle>,
    /// Node identities with a live connection. Claimed atomically during
    /// the handshake, so two simultaneous handshakes from the same identity
    /// cannot both pass the duplicate check.
    identities: DashSet<Hash>,
    apply_queue: mpsc::Sender<ApplyJob>,
}

impl ConnectionManager {
    /// Creates a manager over a shared engine and candidate book, and
    /// spawns its apply worker. Call from within a runtime.
    pub fn new(
        config: ConnectionConfig,
        engine: SharedEngine,
        candidates: Arc<CandidateBook>,
    ) -> Arc<Self> {
        let (apply_tx, apply_rx) = mpsc::channel(APPLY_QUEUE_DEPTH);
        let manager = Arc::new(Self {
            config,
            engine,
            candidates,
            table: DashMap::new(),
            identities: DashSet::new(),
            apply_queue: apply_tx,
        });
        tokio::spawn(Arc::clone(&manager).apply_worker(apply_rx));
        manager
    }

    /// Our own node identity.
    pub fn node_id(&self) -> Hash {
        self.config.node_id
    }

    /// The candidate book the dialer feeds from.
    pub fn candidates(&self) -> &Arc<CandidateBook> {
        &self.candidates
    }

    /// Number of live (handshaked) connections.
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    /// Number of sync-eligible peers, as the engine sees it.
    pub fn pooled_peers(&self) -> usize {
        self.engine.lock().pooled_peers()
    }

    /// Snapshot of every connected peer's metadata.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.table.iter().map(|e| e.value().info.clone()).collect()
    }

    // -- Accept / dial ------------------------------------------------------

    /// Runs the accept loop until the listener fails. Spawn this.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    trace!(%addr, "inbound connection");
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(error) =
                            manager.register(stream, addr, Direction::Inbound).await
                        {
                            debug!(%addr, %error, "inbound handshake failed");
                        }
                    });
                }
                Err(error) => {
                    warn!(%error, "listener accept failed");
                    return;
                }
            }
        }
    }

    /// Dials an address and registers the connection if the handshake
    /// succeeds.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId, HandshakeError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(FrameError::from)?;
        self.register(stream, addr, Direction::Outbound).await
    }

    // -- Handshake ----------------------------------------------------------

    /// Runs the handshake gate on a raw stream and, on success, installs
    /// the connection in the peer table and hands it to the engine.
    async fn register(
        self: &Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
        direction: Direction,
    ) -> Result<PeerId, HandshakeError> {
        let result = tokio::time::timeout(
            self.config.handshake_timeout,
            self.exchange_handshakes(&mut stream, addr, direction),
        )
        .await
        .unwrap_or(Err(HandshakeError::Timeout));

        let info = match result {
            Ok(info) => info,
            Err(error) => {
                if let Some(reason) = error.disconnect_reason() {
                    let _ = write_frame(&mut stream, &Message::Disconnect { reason }).await;
                }
                return Err(error);
            }
        };
        let peer = info.peer;
        info!(
            %peer,
            %addr,
            node_id = %crate::chain::short_hash(&info.node_id),
            height = info.head.height,
            ?direction,
            "peer connected"
        );

        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (close_tx, close_rx) = watch::channel(false);

        let head = info.head;
        self.table.insert(
            peer,
            ConnectionHandle {
                info,
                outbound: outbound_tx,
                close: close_tx,
            },
        );

        tokio::spawn(writer_task(peer, writer, outbound_rx));
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.reader_task(peer, reader, close_rx).await;
        });

        // Hand the peer to the engine and share our address book with it.
        let actions = self.engine.lock().peer_ready(peer, head, unix_ms());
        self.execute(actions).await;
        let addresses = self.exchange_addresses(peer);
        if !addresses.is_empty() {
            self.send(peer, Message::PeerExchange { addresses }).await;
        }
        Ok(peer)
    }

    /// Sends our handshake, reads theirs, and validates it. Pure protocol;
    /// caps and identity checks included, timeout handled by the caller.
    async fn exchange_handshakes(
        &self,
        stream: &mut TcpStream,
        addr: SocketAddr,
        direction: Direction,
    ) -> Result<PeerInfo, HandshakeError> {
        self.check_capacity(addr)?;

        let head = self.engine.lock().local_head();
        write_frame(
            stream,
            &Message::Handshake {
                node_id: self.config.node_id,
                protocol_version: self.config.protocol_version,
                listen_port: self.config.listen_port,
                chain_head: head,
            },
        )
        .await?;

        let frame = read_frame(stream).await?.ok_or(HandshakeError::ClosedEarly)?;
        let (node_id, protocol_version, listen_port, chain_head) = match frame {
            Message::Handshake {
                node_id,
                protocol_version,
                listen_port,
                chain_head,
            } => (node_id, protocol_version, listen_port, chain_head),
            other => return Err(HandshakeError::UnexpectedMessage(other.kind_name())),
        };

        if protocol_version != self.config.protocol_version {
            return Err(HandshakeError::IncompatibleVersion {
                ours: self.config.protocol_version,
                theirs: protocol_version,
            });
        }
        if node_id == self.config.node_id {
            return Err(HandshakeError::SelfConnection);
        }
        // Atomic claim: `insert` returning false means another connection
        // holds (or is mid-handshake with) this identity. The claim is
        // released in `disconnect`.
        if !self.identities.insert(node_id) {
            return Err(HandshakeError::DuplicatePeer);
        }

        Ok(PeerInfo {
            peer: PeerId::next(),
            addr,
            listen_addr: SocketAddr::new(addr.ip(), listen_port),
            node_id,
            protocol_version,
            direction,
            head: chain_head,
            connected_at: unix_ms(),
        })
    }

    fn check_capacity(&self, addr: SocketAddr) -> Result<(), HandshakeError> {
        if self.table.len() >= self.config.max_connections {
            return Err(HandshakeError::TooManyPeers);
        }
        let from_ip = self
            .table
            .iter()
            .filter(|e| e.value().info.addr.ip() == addr.ip())
            .count();
        if from_ip >= self.config.max_connections_per_ip {
            return Err(HandshakeError::TooManyPeers);
        }
        Ok(())
    }

    /// Listener addresses of every other connected peer, capped at the wire
    /// limit. What we share via `PeerExchange`.
    fn exchange_addresses(&self, exclude: PeerId) -> Vec<SocketAddr> {
        self.table
            .iter()
            .filter(|e| *e.key() != exclude)
            .map(|e| e.value().info.listen_addr)
            .take(config::MAX_EXCHANGED_ADDRESSES)
            .collect()
    }

    // -- Per-connection reader ---------------------------------------------

    async fn reader_task(
        self: Arc<Self>,
        peer: PeerId,
        mut reader: OwnedReadHalf,
        mut close: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = close.changed() => break,
                frame = read_frame(&mut reader) => match frame {
                    Ok(Some(message)) => {
                        let actions = self
                            .engine
                            .lock()
                            .handle_message(peer, message, unix_ms());
                        self.execute(actions).await;
                    }
                    Ok(None) => {
                        debug!(%peer, "peer closed connection");
                        break;
                    }
                    Err(error) => {
                        warn!(%peer, %error, "frame error, dropping connection");
                        self.disconnect(peer, DisconnectReason::BadProtocol).await;
                        break;
                    }
                },
            }
        }
        // Covers remote EOF and the close signal alike; a second call after
        // an explicit disconnect finds nothing to do.
        self.disconnect(peer, DisconnectReason::Requested).await;
    }

    // -- Disconnect ---------------------------------------------------------

    /// Closes a connection: goodbye frame where possible, table removal,
    /// engine cleanup, dialer release. Idempotent.
    pub async fn disconnect(&self, peer: PeerId, reason: DisconnectReason) {
        let Some((_, handle)) = self.table.remove(&peer) else {
            return;
        };
        info!(%peer, ?reason, "disconnecting peer");
        let _ = handle.outbound.try_send(Message::Disconnect { reason });
        let _ = handle.close.send(true);
        self.identities.remove(&handle.info.node_id);
        self.engine.lock().peer_disconnected(peer, unix_ms());
        if handle.info.direction == Direction::Outbound {
            self.candidates.release(handle.info.addr, unix_ms());
        }
        // Handle drops here: writer queue closes after the goodbye frame.
    }

    /// Disconnects everything. Called on shutdown.
    pub async fn shutdown(&self) {
        let peers: Vec<PeerId> = self.table.iter().map(|e| *e.key()).collect();
        for peer in peers {
            self.disconnect(peer, DisconnectReason::Requested).await;
        }
    }

    // -- Action execution ---------------------------------------------------

    /// Carries out the engine's verdicts.
    pub async fn execute(&self, actions: Vec<SyncAction>) {
        for action in actions {
            match action {
                SyncAction::Send { peer, message } => {
                    self.send(peer, message).await;
                }
                SyncAction::Disconnect { peer, reason } => {
                    self.disconnect(peer, reason).await;
                }
                SyncAction::AddCandidates(addresses) => {
                    self.candidates.add_many(&addresses);
                }
                SyncAction::Apply { peer, items } => {
                    // Waits when the queue is full; the caller holds no
                    // engine lock here, so dispatch elsewhere continues.
                    if self.apply_queue.send(ApplyJob { peer, items }).await.is_err() {
                        warn!(%peer, "apply worker gone, batch dropped");
                    }
                }
            }
        }
    }

    // -- Apply worker --------------------------------------------------------

    /// Drains the apply queue: each batch runs through the ledger on the
    /// blocking pool, then its outcomes are committed to the engine.
    async fn apply_worker(self: Arc<Self>, mut jobs: mpsc::Receiver<ApplyJob>) {
        while let Some(job) = jobs.recv().await {
            let ledger = self.engine.lock().ledger();
            let ApplyJob { peer, items } = job;
            let outcomes =
                tokio::task::spawn_blocking(move || apply_batch(ledger.as_ref(), items)).await;
            let Ok(outcomes) = outcomes else {
                warn!(%peer, "apply task failed, batch dropped");
                continue;
            };
            let actions = self.engine.lock().batch_applied(peer, outcomes, unix_ms());
            self.execute(actions).await;
        }
    }

    /// Queues a message to one peer. A missing peer or a full queue drops
    /// the message; request deadlines recover either case.
    async fn send(&self, peer: PeerId, message: Message) {
        // Clone the sender out of the table entry so no map guard is held
        // across the await.
        let Some(outbound) = self.table.get(&peer).map(|e| e.outbound.clone()) else {
            trace!(%peer, kind = message.kind_name(), "send to unknown peer dropped");
            return;
        };
        if outbound.send(message).await.is_err() {
            trace!(%peer, "outbound queue closed");
        }
    }

    // -- Periodic driver ----------------------------------------------------

    /// Drives the engine's deadline sweep and sync scheduling. Spawn this.
    pub async fn run_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(config::TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let actions = self.engine.lock().tick(unix_ms());
            self.execute(actions).await;
        }
    }
}

/// Drains the outbound queue onto the socket. Exits when the queue closes
/// (handle dropped) or the socket dies.
async fn writer_task(peer: PeerId, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(error) = write_frame(&mut writer, &message).await {
            trace!(%peer, %error, "write failed, writer exiting");
            break;
        }
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainHead;
    use crate::ledger::{LedgerDelegate, MemoryLedger};
    use crate::network::connector::ConnectorConfig;
    use crate::network::engine::{SyncConfig, SyncEngine};
    use crate::network::pool::PoolConfig;

    fn make_manager(listen_port: u16) -> Arc<ConnectionManager> {
        let ledger = Arc::new(MemoryLedger::new());
        let engine = SyncEngine::new(
            SyncConfig::default(),
            PoolConfig::default(),
            ledger as Arc<dyn LedgerDelegate>,
        )
        .shared();
        let candidates = Arc::new(CandidateBook::new(ConnectorConfig::default()));
        ConnectionManager::new(ConnectionConfig::new(listen_port), engine, candidates)
    }

    async fn spawn_listener(manager: &Arc<ConnectionManager>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(manager).listen(listener));
        addr
    }

    async fn settle() {
        // Handshakes run in spawned tasks; yield long enough for both
        // sides to register.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn two_nodes_handshake_and_pool_each_other() {
        let a = make_manager(0);
        let b = make_manager(0);
        let a_addr = spawn_listener(&a).await;

        let peer = b.connect(a_addr).await.expect("handshake");
        settle().await;

        assert_eq!(a.connection_count(), 1);
        assert_eq!(b.connection_count(), 1);
        assert_eq!(a.pooled_peers(), 1);
        assert_eq!(b.pooled_peers(), 1);

        b.disconnect(peer, DisconnectReason::Requested).await;
        settle().await;
        assert_eq!(b.connection_count(), 0);
        assert_eq!(b.pooled_peers(), 0);
        // A's reader observes the close and cleans up too.
        assert_eq!(a.connection_count(), 0);
    }

    #[tokio::test]
    async fn self_connection_is_rejected() {
        let a = make_manager(0);
        let addr = spawn_listener(&a).await;

        match a.connect(addr).await {
            Err(HandshakeError::SelfConnection) => {}
            other => panic!("expected SelfConnection, got {other:?}"),
        }
        settle().await;
        assert_eq!(a.connection_count(), 0);
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected_with_a_reason() {
        let a = make_manager(0);
        let addr = spawn_listener(&a).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut stream,
            &Message::Handshake {
                node_id: [9u8; 32],
                protocol_version: 99,
                listen_port: 1,
                chain_head: ChainHead::genesis(),
            },
        )
        .await
        .unwrap();

        // A sends its own handshake first, then the rejection.
        let first = read_frame(&mut stream).await.unwrap().unwrap();
        assert!(matches!(first, Message::Handshake { .. }));
        let second = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(
            second,
            Message::Disconnect {
                reason: DisconnectReason::IncompatibleVersion,
            }
        );
        settle().await;
        assert_eq!(a.connection_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_identity_is_rejected() {
        let a = make_manager(0);
        let b = make_manager(0);
        let a_addr = spawn_listener(&a).await;

        b.connect(a_addr).await.expect("first handshake");
        settle().await;
        match b.connect(a_addr).await {
            // Whichever side notices first: B sees A's identity twice, or A
            // rejects and B observes the dropped stream.
            Err(HandshakeError::DuplicatePeer) | Err(HandshakeError::ClosedEarly) => {}
            Err(HandshakeError::Frame(_)) => {}
            other => panic!("expected duplicate rejection, got {other:?}"),
        }
        settle().await;
        assert_eq!(b.connection_count(), 1);
    }

    #[tokio::test]
    async fn identity_claim_is_released_on_disconnect() {
        let a = make_manager(0);
        let b = make_manager(0);
        let a_addr = spawn_listener(&a).await;

        let peer = b.connect(a_addr).await.expect("first handshake");
        settle().await;
        assert!(a.identities.contains(&b.node_id()));

        b.disconnect(peer, DisconnectReason::Requested).await;
        settle().await;
        assert!(!a.identities.contains(&b.node_id()));

        // The identity is free again: the same node may reconnect.
        b.connect(a_addr).await.expect("reconnect after disconnect");
        settle().await;
        assert_eq!(a.connection_count(), 1);
    }

    #[tokio::test]
    async fn per_ip_cap_limits_loopback_connections() {
        let mut config = ConnectionConfig::new(0);
        config.max_connections_per_ip = 1;
        let ledger = Arc::new(MemoryLedger::new());
        let engine = SyncEngine::new(
            SyncConfig::default(),
            PoolConfig::default(),
            ledger as Arc<dyn LedgerDelegate>,
        )
        .shared();
        let candidates = Arc::new(CandidateBook::new(ConnectorConfig::default()));
        let a = ConnectionManager::new(config, engine, candidates);
        let addr = spawn_listener(&a).await;

        let b = make_manager(0);
        let c = make_manager(0);
        b.connect(addr).await.expect("first connection fits");
        settle().await;
        assert!(c.connect(addr).await.is_err());
        settle().await;
        assert_eq!(a.connection_count(), 1);
    }
}

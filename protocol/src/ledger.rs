//! # Ledger Delegate
//!
//! The narrow boundary between the sync engine and the node's authoritative
//! block/transaction store. The engine never validates content itself — it
//! asks the ledger "do you have X / is X valid / apply X" and treats the
//! answer as final.
//!
//! The contract is deliberately tri-state: `Accepted`, `AlreadyPresent`, and
//! `Rejected` are distinct outcomes. Collapsing "already had it" into either
//! success or failure would corrupt peer scoring — a peer that re-sends a
//! block we accepted from someone else did nothing wrong.
//!
//! `MemoryLedger` is the reference implementation used by the node binary
//! and by every engine test. Production deployments swap in a delegate
//! backed by the real storage engine; the sync layer cannot tell the
//! difference, which is the point.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::chain::{Block, ChainHead, Hash, InventoryItem, ItemKind, Transaction};

// ---------------------------------------------------------------------------
// Apply Outcome
// ---------------------------------------------------------------------------

/// The ledger's verdict on a submitted item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The item was valid and is now part of local state.
    Accepted,
    /// The item was already known; nothing changed. Not an error.
    AlreadyPresent,
    /// The item failed validation. The reason is for logging and scoring,
    /// not for the wire.
    Rejected(String),
}

/// An item handed to the ledger for validation and application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerItem {
    /// A block received from a peer (or produced locally).
    Block(Block),
    /// A standalone transaction from gossip.
    Transaction(Transaction),
}

impl LedgerItem {
    /// The inventory reference for this item.
    pub fn inventory(&self) -> InventoryItem {
        match self {
            Self::Block(b) => InventoryItem::block(b.hash),
            Self::Transaction(t) => InventoryItem::transaction(t.id),
        }
    }
}

// ---------------------------------------------------------------------------
// LedgerDelegate
// ---------------------------------------------------------------------------

/// The sync engine's view of the ledger.
///
/// Implementations must be cheap to query (`has`, `current_head`) and may be
/// slow to apply; the engine serializes `validate_and_apply` calls so the
/// ledger never sees the same item submitted concurrently from two sync
/// sessions.
pub trait LedgerDelegate: Send + Sync {
    /// Does the ledger already hold this item?
    fn has(&self, item: &InventoryItem) -> bool;

    /// Validate the item and, if valid, make it part of local state.
    fn validate_and_apply(&self, item: LedgerItem) -> ApplyOutcome;

    /// The current best chain tip.
    fn current_head(&self) -> ChainHead;

    /// Hashes of up to `limit` main-chain blocks at heights
    /// `[from_height, from_height + limit)`, ascending. Serves peers'
    /// catch-up probes.
    fn block_hashes_after(&self, from_height: u64, limit: u64) -> Vec<Hash>;

    /// Fetch a block by hash, if present.
    fn get_block(&self, hash: &Hash) -> Option<Block>;

    /// Fetch a pool/ledger transaction by id, if present.
    fn get_transaction(&self, hash: &Hash) -> Option<Transaction>;
}

// ---------------------------------------------------------------------------
// MemoryLedger
// ---------------------------------------------------------------------------

/// HashMap-backed ledger holding a single linear chain plus loose
/// transactions. Validation is structural only: correct content hashes,
/// parent linkage to the current tip, contiguous heights.
pub struct MemoryLedger {
    inner: RwLock<MemoryLedgerInner>,
}

struct MemoryLedgerInner {
    /// Blocks by hash.
    blocks: HashMap<Hash, Block>,
    /// Main-chain block hashes indexed by height.
    by_height: Vec<Hash>,
    /// Standalone transactions accepted from gossip.
    transactions: HashMap<Hash, Transaction>,
}

impl MemoryLedger {
    /// Creates a ledger containing only the genesis block.
    pub fn new() -> Self {
        let genesis = Block::genesis();
        let mut blocks = HashMap::new();
        blocks.insert(genesis.hash, genesis.clone());
        Self {
            inner: RwLock::new(MemoryLedgerInner {
                blocks,
                by_height: vec![genesis.hash],
                transactions: HashMap::new(),
            }),
        }
    }

    /// Number of blocks on the main chain (including genesis).
    pub fn chain_len(&self) -> usize {
        self.inner.read().by_height.len()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerDelegate for MemoryLedger {
    fn has(&self, item: &InventoryItem) -> bool {
        let inner = self.inner.read();
        match item.kind {
            ItemKind::Block => inner.blocks.contains_key(&item.hash),
            ItemKind::Transaction => inner.transactions.contains_key(&item.hash),
        }
    }

    fn validate_and_apply(&self, item: LedgerItem) -> ApplyOutcome {
        let mut inner = self.inner.write();
        match item {
            LedgerItem::Block(block) => {
                if inner.blocks.contains_key(&block.hash) {
                    return ApplyOutcome::AlreadyPresent;
                }
                if !block.verify() {
                    return ApplyOutcome::Rejected("content hash mismatch".into());
                }
                let tip_hash = *inner.by_height.last().expect("chain has genesis");
                let tip_height = (inner.by_height.len() - 1) as u64;
                if block.parent_hash != tip_hash {
                    return ApplyOutcome::Rejected(format!(
                        "parent {} is not the current tip",
                        crate::chain::short_hash(&block.parent_hash)
                    ));
                }
                if block.height != tip_height + 1 {
                    return ApplyOutcome::Rejected(format!(
                        "height {} does not extend tip at {}",
                        block.height, tip_height
                    ));
                }
                inner.by_height.push(block.hash);
                inner.blocks.insert(block.hash, block);
                ApplyOutcome::Accepted
            }
            LedgerItem::Transaction(tx) => {
                if inner.transactions.contains_key(&tx.id) {
                    return ApplyOutcome::AlreadyPresent;
                }
                if !tx.verify_id() {
                    return ApplyOutcome::Rejected("transaction id mismatch".into());
                }
                inner.transactions.insert(tx.id, tx);
                ApplyOutcome::Accepted
            }
        }
    }

    fn current_head(&self) -> ChainHead {
        let inner = self.inner.read();
        let hash = *inner.by_height.last().expect("chain has genesis");
        ChainHead {
            hash,
            height: (inner.by_height.len() - 1) as u64,
        }
    }

    fn block_hashes_after(&self, from_height: u64, limit: u64) -> Vec<Hash> {
        let inner = self.inner.read();
        let start = from_height as usize;
        if start >= inner.by_height.len() {
            return Vec::new();
        }
        let end = start.saturating_add(limit as usize).min(inner.by_height.len());
        inner.by_height[start..end].to_vec()
    }

    fn get_block(&self, hash: &Hash) -> Option<Block> {
        self.inner.read().blocks.get(hash).cloned()
    }

    fn get_transaction(&self, hash: &Hash) -> Option<Transaction> {
        self.inner.read().transactions.get(hash).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a chain of empty blocks on top of genesis.
    fn make_chain(count: usize) -> Vec<Block> {
        let mut chain = vec![Block::genesis()];
        for _ in 0..count {
            let parent = chain.last().unwrap().head();
            chain.push(Block::new(&parent, vec![]));
        }
        chain
    }

    #[test]
    fn fresh_ledger_is_at_genesis() {
        let ledger = MemoryLedger::new();
        let head = ledger.current_head();
        assert_eq!(head.height, 0);
        assert_eq!(head.hash, Block::genesis().hash);
        assert!(ledger.has(&InventoryItem::block(head.hash)));
    }

    #[test]
    fn blocks_extend_the_tip() {
        let ledger = MemoryLedger::new();
        let chain = make_chain(3);

        for block in &chain[1..] {
            assert_eq!(
                ledger.validate_and_apply(LedgerItem::Block(block.clone())),
                ApplyOutcome::Accepted
            );
        }
        assert_eq!(ledger.current_head().height, 3);
        assert_eq!(ledger.current_head().hash, chain[3].hash);
    }

    #[test]
    fn duplicate_block_is_already_present() {
        let ledger = MemoryLedger::new();
        let chain = make_chain(1);

        assert_eq!(
            ledger.validate_and_apply(LedgerItem::Block(chain[1].clone())),
            ApplyOutcome::Accepted
        );
        assert_eq!(
            ledger.validate_and_apply(LedgerItem::Block(chain[1].clone())),
            ApplyOutcome::AlreadyPresent
        );
        assert_eq!(ledger.current_head().height, 1);
    }

    #[test]
    fn detached_block_is_rejected() {
        let ledger = MemoryLedger::new();
        let chain = make_chain(2);

        // Skipping block 1 leaves block 2 without its parent at the tip.
        match ledger.validate_and_apply(LedgerItem::Block(chain[2].clone())) {
            ApplyOutcome::Rejected(_) => {}
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(ledger.current_head().height, 0);
    }

    #[test]
    fn corrupted_block_is_rejected() {
        let ledger = MemoryLedger::new();
        let mut block = make_chain(1).remove(1);
        block.hash[0] ^= 0xFF;

        match ledger.validate_and_apply(LedgerItem::Block(block)) {
            ApplyOutcome::Rejected(_) => {}
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn transactions_round_trip() {
        let ledger = MemoryLedger::new();
        let tx = Transaction::new(b"coffee".to_vec());

        assert!(!ledger.has(&InventoryItem::transaction(tx.id)));
        assert_eq!(
            ledger.validate_and_apply(LedgerItem::Transaction(tx.clone())),
            ApplyOutcome::Accepted
        );
        assert!(ledger.has(&InventoryItem::transaction(tx.id)));
        assert_eq!(ledger.get_transaction(&tx.id), Some(tx));
    }

    #[test]
    fn block_hashes_after_serves_ranges() {
        let ledger = MemoryLedger::new();
        let chain = make_chain(5);
        for block in &chain[1..] {
            ledger.validate_and_apply(LedgerItem::Block(block.clone()));
        }

        let hashes = ledger.block_hashes_after(2, 2);
        assert_eq!(hashes, vec![chain[2].hash, chain[3].hash]);

        // Past the tip: empty, not an error.
        assert!(ledger.block_hashes_after(99, 10).is_empty());

        // Limit larger than the remaining chain is clamped.
        assert_eq!(ledger.block_hashes_after(4, 100).len(), 2);
    }
}

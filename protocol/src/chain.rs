//! # Chain Value Types
//!
//! The immutable value objects the sync protocol moves around: content
//! hashes, chain heads, blocks, transactions, and the inventory references
//! used to announce them without shipping payloads.
//!
//! KESTREL does not define validation rules — that is the ledger's job.
//! Blocks here carry exactly enough structure (hash, parent link, height)
//! for the sync engine to order and deduplicate them.

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 content hash. Identifies blocks and transactions on the
/// wire and in every bookkeeping map.
pub type Hash = [u8; 32];

/// Renders a hash the way log lines want it: first 8 hex chars.
pub fn short_hash(hash: &Hash) -> String {
    hex::encode(&hash[..4])
}

// ---------------------------------------------------------------------------
// Chain Head
// ---------------------------------------------------------------------------

/// A node's best-known chain tip, exchanged in the handshake and compared
/// when deciding whether a peer is worth syncing from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    /// Hash of the tip block.
    pub hash: Hash,
    /// Height of the tip block. Genesis is height 0.
    pub height: u64,
}

impl ChainHead {
    /// The head of an empty chain: genesis at height 0.
    pub fn genesis() -> Self {
        Self {
            hash: Block::genesis().hash,
            height: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// What kind of item an inventory reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    /// A full block.
    Block,
    /// A standalone transaction (not yet in a block).
    Transaction,
}

/// A typed reference to a block or transaction. Announce/request/response
/// correlation happens on these, never on payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryItem {
    /// Item category.
    pub kind: ItemKind,
    /// Content hash of the item.
    pub hash: Hash,
}

impl InventoryItem {
    /// Reference to a block by hash.
    pub fn block(hash: Hash) -> Self {
        Self {
            kind: ItemKind::Block,
            hash,
        }
    }

    /// Reference to a transaction by hash.
    pub fn transaction(hash: Hash) -> Self {
        Self {
            kind: ItemKind::Transaction,
            hash,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// An opaque transaction. The sync layer gossips these; validation and
/// execution live behind the ledger delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Content hash of `payload`. Recomputable, so a peer cannot lie about it.
    pub id: Hash,
    /// Serialized transaction body, uninterpreted here.
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Builds a transaction from a raw payload, deriving its id.
    pub fn new(payload: Vec<u8>) -> Self {
        let id = *blake3::hash(&payload).as_bytes();
        Self { id, payload }
    }

    /// Recomputes the content hash and checks it against the claimed id.
    pub fn verify_id(&self) -> bool {
        *blake3::hash(&self.payload).as_bytes() == self.id
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A block as the sync protocol sees it: a hash-linked container of
/// transactions at a height. Consensus metadata is part of the opaque
/// payloads as far as this subsystem is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Content hash over (parent_hash, height, transaction ids).
    pub hash: Hash,
    /// Hash of the preceding block. All zeros for genesis.
    pub parent_hash: Hash,
    /// Position in the chain. Genesis is 0.
    pub height: u64,
    /// Transactions included in this block.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Builds a block on top of `parent`, deriving its hash.
    pub fn new(parent: &ChainHead, transactions: Vec<Transaction>) -> Self {
        let mut block = Self {
            hash: [0u8; 32],
            parent_hash: parent.hash,
            height: parent.height + 1,
            transactions,
        };
        block.hash = block.compute_hash();
        block
    }

    /// The genesis block. Hardcoded, never downloaded.
    pub fn genesis() -> Self {
        let mut block = Self {
            hash: [0u8; 32],
            parent_hash: [0u8; 32],
            height: 0,
            transactions: Vec::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Recomputes the content hash from the linked fields.
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.parent_hash);
        hasher.update(&self.height.to_le_bytes());
        for tx in &self.transactions {
            hasher.update(&tx.id);
        }
        *hasher.finalize().as_bytes()
    }

    /// Structural integrity check: claimed hash matches content, and every
    /// transaction id matches its payload.
    pub fn verify(&self) -> bool {
        self.hash == self.compute_hash() && self.transactions.iter().all(Transaction::verify_id)
    }

    /// The head this block would establish if it became the tip.
    pub fn head(&self) -> ChainHead {
        ChainHead {
            hash: self.hash,
            height: self.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_stable() {
        assert_eq!(Block::genesis(), Block::genesis());
        assert_eq!(ChainHead::genesis().height, 0);
        assert_eq!(ChainHead::genesis().hash, Block::genesis().hash);
    }

    #[test]
    fn block_hash_covers_contents() {
        let genesis = Block::genesis();
        let tx = Transaction::new(b"pay alice 5".to_vec());
        let block = Block::new(&genesis.head(), vec![tx]);

        assert!(block.verify());
        assert_eq!(block.height, 1);
        assert_eq!(block.parent_hash, genesis.hash);

        // Tampering with the body breaks verification.
        let mut tampered = block.clone();
        tampered.transactions.clear();
        assert!(!tampered.verify());
    }

    #[test]
    fn transaction_id_is_derived() {
        let tx = Transaction::new(b"hello".to_vec());
        assert!(tx.verify_id());

        let mut forged = tx.clone();
        forged.payload.push(0xFF);
        assert!(!forged.verify_id());
    }

    #[test]
    fn short_hash_renders_prefix() {
        let mut hash = [0u8; 32];
        hash[0] = 0xAB;
        hash[1] = 0xCD;
        assert_eq!(short_hash(&hash), "abcd0000");
    }
}

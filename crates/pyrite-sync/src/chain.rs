//! Injected chain capabilities.
//!
//! The synchronizer never reaches into a chain database directly. It is
//! handed a [`ChainStore`] for the canonical chain and a [`StateDb`] for raw
//! state trie nodes, which keeps the engine testable against in-memory
//! fakes.

use pyrite_types::{Block, BlockNumber, Hash256, Header, Receipt, TotalDifficulty};

/// A partially applied chain mutation.
///
/// `index` is the position of the first item that was rejected; items before
/// it were applied and may need to be rolled back by the caller.
#[derive(Debug, Clone)]
pub struct ImportFailure {
    /// Index of the first rejected item.
    pub index: usize,
    /// Human readable rejection reason.
    pub reason: String,
}

impl ImportFailure {
    /// Convenience constructor.
    pub fn new(index: usize, reason: impl Into<String>) -> Self {
        Self {
            index,
            reason: reason.into(),
        }
    }
}

/// Local chain store as seen by the synchronizer.
pub trait ChainStore: Send + Sync {
    /// Head of the header chain.
    fn current_header(&self) -> Header;

    /// Head of the fully imported block chain.
    fn current_block(&self) -> Header;

    /// Head of the fast-sync block chain (blocks imported with receipts but
    /// without execution).
    fn current_fast_block(&self) -> Header;

    /// Whether the header is known at the given height.
    fn has_header(&self, hash: &Hash256, number: BlockNumber) -> bool;

    /// Whether the block and its post-state are fully available.
    fn has_block_and_state(&self, hash: &Hash256) -> bool;

    /// Look up a header by hash.
    fn header_by_hash(&self, hash: &Hash256) -> Option<Header>;

    /// Total difficulty accumulated up to the given block.
    fn td_by_hash(&self, hash: &Hash256) -> Option<TotalDifficulty>;

    /// Append a contiguous header chain, verifying every `verify_frequency`-th
    /// header. On failure, headers before `ImportFailure::index` were
    /// applied.
    fn insert_header_chain(
        &self,
        headers: &[Header],
        verify_frequency: usize,
    ) -> Result<(), ImportFailure>;

    /// Execute and append fully assembled blocks.
    fn insert_chain(&self, blocks: Vec<Block>) -> Result<(), ImportFailure>;

    /// Append blocks together with their receipts, without execution.
    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<(), ImportFailure>;

    /// Promote a fast-synced block to the full chain head once its state is
    /// complete.
    fn fast_sync_commit_head(&self, hash: Hash256) -> Result<(), ImportFailure>;

    /// Remove the given headers (and any associated chain data) from the
    /// local chain.
    fn rollback(&self, hashes: &[Hash256]);
}

/// Raw state trie node storage.
pub trait StateDb: Send + Sync {
    /// Whether a node with this hash is already stored.
    fn contains(&self, hash: &Hash256) -> bool;

    /// Store a verified trie node.
    fn insert(&self, hash: Hash256, data: Vec<u8>);
}

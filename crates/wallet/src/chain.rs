//! Read-only view of the active chain, as consumed by imports and rescans.

use std::fmt;
use std::sync::RwLock;

use fluxd_consensus::Hash256;
use fluxd_primitives::block::CURRENT_VERSION;
use fluxd_primitives::{Block, BlockHeader, Transaction};

const MTP_WINDOW_SIZE: usize = 11;
const REGTEST_BITS: u32 = 0x207f_ffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    Backend(String),
    Poisoned,
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Backend(message) => write!(f, "chain error: {message}"),
            ChainError::Poisoned => write!(f, "chain lock poisoned"),
        }
    }
}

impl std::error::Error for ChainError {}

/// Index entry for one block of the active chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockRef {
    pub height: u32,
    pub hash: Hash256,
    pub time: i64,
    /// Largest block time up to and including this block.
    pub time_max: i64,
    pub median_time_past: i64,
}

pub trait ChainView: Send + Sync {
    fn tip(&self) -> Result<Option<BlockRef>, ChainError>;

    fn have_pruned(&self) -> Result<bool, ChainError>;

    fn block_at_height(&self, height: u32) -> Result<Option<BlockRef>, ChainError>;

    /// First block whose `time_max` is at least `time`.
    fn find_first_block_with_time(&self, time: i64) -> Result<Option<BlockRef>, ChainError>;

    /// Full block data; `None` when the block is not on disk.
    fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError>;

    /// Looks a block up in the active chain only.
    fn block_ref_by_hash(&self, hash: &Hash256) -> Result<Option<BlockRef>, ChainError>;
}

struct StoredBlock {
    entry: BlockRef,
    block: Option<Block>,
}

#[derive(Default)]
struct MemoryChainInner {
    blocks: Vec<StoredBlock>,
    pruned: bool,
}

/// In-memory chain used by tests and tools.
#[derive(Default)]
pub struct MemoryChain {
    inner: RwLock<MemoryChainInner>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mines a block on top of the tip holding `transactions`.
    pub fn append(&self, transactions: Vec<Transaction>, time: u32) -> Result<BlockRef, ChainError> {
        let prev_block = self.tip()?.map(|tip| tip.hash).unwrap_or([0u8; 32]);
        let mut block = Block {
            header: BlockHeader {
                version: CURRENT_VERSION,
                prev_block,
                merkle_root: [0u8; 32],
                time,
                bits: REGTEST_BITS,
                nonce: [0u8; 32],
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root();
        self.push_block(block)
    }

    pub fn push_block(&self, block: Block) -> Result<BlockRef, ChainError> {
        let mut inner = self.inner.write().map_err(|_| ChainError::Poisoned)?;
        let height = inner.blocks.len() as u32;
        if let Some(prev) = inner.blocks.last() {
            if prev.entry.hash != block.header.prev_block {
                return Err(ChainError::Backend(
                    "block does not extend the active chain".to_string(),
                ));
            }
        }
        let time = i64::from(block.header.time);
        let time_max = inner
            .blocks
            .last()
            .map_or(time, |prev| prev.entry.time_max.max(time));
        let mut window: Vec<i64> = inner
            .blocks
            .iter()
            .rev()
            .take(MTP_WINDOW_SIZE - 1)
            .map(|stored| stored.entry.time)
            .collect();
        window.push(time);
        window.sort_unstable();
        let entry = BlockRef {
            height,
            hash: block.header.hash(),
            time,
            time_max,
            median_time_past: window[window.len() / 2],
        };
        inner.blocks.push(StoredBlock {
            entry,
            block: Some(block),
        });
        Ok(entry)
    }

    /// Drops block data below `height`; index entries stay.
    pub fn prune_below(&self, height: u32) -> Result<(), ChainError> {
        let mut inner = self.inner.write().map_err(|_| ChainError::Poisoned)?;
        let mut pruned_any = false;
        for stored in inner.blocks.iter_mut().take(height as usize) {
            pruned_any |= stored.block.take().is_some();
        }
        inner.pruned |= pruned_any;
        Ok(())
    }

    pub fn block(&self, height: u32) -> Result<Option<Block>, ChainError> {
        let inner = self.inner.read().map_err(|_| ChainError::Poisoned)?;
        Ok(inner
            .blocks
            .get(height as usize)
            .and_then(|stored| stored.block.clone()))
    }
}

impl ChainView for MemoryChain {
    fn tip(&self) -> Result<Option<BlockRef>, ChainError> {
        let inner = self.inner.read().map_err(|_| ChainError::Poisoned)?;
        Ok(inner.blocks.last().map(|stored| stored.entry))
    }

    fn have_pruned(&self) -> Result<bool, ChainError> {
        let inner = self.inner.read().map_err(|_| ChainError::Poisoned)?;
        Ok(inner.pruned)
    }

    fn block_at_height(&self, height: u32) -> Result<Option<BlockRef>, ChainError> {
        let inner = self.inner.read().map_err(|_| ChainError::Poisoned)?;
        Ok(inner.blocks.get(height as usize).map(|stored| stored.entry))
    }

    fn find_first_block_with_time(&self, time: i64) -> Result<Option<BlockRef>, ChainError> {
        let inner = self.inner.read().map_err(|_| ChainError::Poisoned)?;
        let index = inner
            .blocks
            .partition_point(|stored| stored.entry.time_max < time);
        Ok(inner.blocks.get(index).map(|stored| stored.entry))
    }

    fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        let inner = self.inner.read().map_err(|_| ChainError::Poisoned)?;
        Ok(inner
            .blocks
            .iter()
            .find(|stored| stored.entry.hash == *hash)
            .and_then(|stored| stored.block.clone()))
    }

    fn block_ref_by_hash(&self, hash: &Hash256) -> Result<Option<BlockRef>, ChainError> {
        let inner = self.inner.read().map_err(|_| ChainError::Poisoned)?;
        Ok(inner
            .blocks
            .iter()
            .find(|stored| stored.entry.hash == *hash)
            .map(|stored| stored.entry))
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use smallvec::SmallVec;
use tycho_types::models::BlockId;

#[cfg(any(test, feature = "test"))]
pub use self::test_ledger::{TestChainBuilder, TestLedger, TestLedgerCalls, make_block_id};

#[cfg(any(test, feature = "test"))]
mod test_ledger;

/// Parents of a block. Two entries only right after a shard merge.
pub type PrevBlocks = SmallVec<[BlockId; MAX_PREV_BLOCKS]>;

pub const MAX_PREV_BLOCKS: usize = 2;

/// Fails with a decode error if the block has more parents than a merge produces.
pub fn check_prev_blocks(block_id: &BlockId, prev_blocks: &[BlockId]) -> Result<(), LedgerError> {
    if prev_blocks.len() > MAX_PREV_BLOCKS {
        return Err(LedgerError::decode(anyhow::anyhow!(
            "block {block_id} has {} parents",
            prev_blocks.len()
        )));
    }
    Ok(())
}

/// Source of chain data.
///
/// Implementations own their retry policy, the scanner never retries
/// a failed request within a cycle.
#[async_trait]
pub trait LedgerClient: Send + Sync + 'static {
    /// Returns the latest masterchain block.
    async fn get_head(&self) -> Result<BlockId, LedgerError>;

    /// Returns the top shard blocks registered in the specified masterchain block.
    ///
    /// NOTE: All workchains are returned.
    async fn get_shards(&self, mc_block_id: &BlockId) -> Result<Vec<BlockId>, LedgerError>;

    /// Returns parents of the specified block.
    async fn get_prev_blocks(&self, block_id: &BlockId) -> Result<PrevBlocks, LedgerError>;
}

#[async_trait]
impl<T: LedgerClient + ?Sized> LedgerClient for Arc<T> {
    async fn get_head(&self) -> Result<BlockId, LedgerError> {
        T::get_head(self).await
    }

    async fn get_shards(&self, mc_block_id: &BlockId) -> Result<Vec<BlockId>, LedgerError> {
        T::get_shards(self, mc_block_id).await
    }

    async fn get_prev_blocks(&self, block_id: &BlockId) -> Result<PrevBlocks, LedgerError> {
        T::get_prev_blocks(self, block_id).await
    }
}

#[async_trait]
impl<T: LedgerClient + ?Sized> LedgerClient for Box<T> {
    async fn get_head(&self) -> Result<BlockId, LedgerError> {
        T::get_head(self).await
    }

    async fn get_shards(&self, mc_block_id: &BlockId) -> Result<Vec<BlockId>, LedgerError> {
        T::get_shards(self, mc_block_id).await
    }

    async fn get_prev_blocks(&self, block_id: &BlockId) -> Result<PrevBlocks, LedgerError> {
        T::get_prev_blocks(self, block_id).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger connection error")]
    Connection(#[source] anyhow::Error),
    #[error("malformed ledger response")]
    Decode(#[source] anyhow::Error),
}

impl LedgerError {
    pub fn connection<E: Into<anyhow::Error>>(e: E) -> Self {
        Self::Connection(e.into())
    }

    pub fn decode<E: Into<anyhow::Error>>(e: E) -> Self {
        Self::Decode(e.into())
    }
}

use tycho_types::models::BlockId;

use crate::ledger::LedgerError;

/// Chain data contradicts the block graph model.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("masterchain mismatch: expected {expected}, found {found}")]
    McChainMismatch { expected: BlockId, found: BlockId },
    #[error("masterchain block {block_id} has {count} parents")]
    MultipleMcParents { block_id: BlockId, count: usize },
    #[error("masterchain genesis reached at {block_id}")]
    McGenesisReached { block_id: BlockId },
    #[error("block hash mismatch: known {known}, found {found}")]
    HashMismatch { known: BlockId, found: BlockId },
    #[error("shard walk from {root} exceeded {max_depth} blocks")]
    ShardWalkTooDeep { root: BlockId, max_depth: usize },
    #[error("no shards of workchain {workchain} in {mc_block_id}")]
    NoShards { mc_block_id: BlockId, workchain: i32 },
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    ProtocolViolation(#[from] ProtocolViolation),
    #[error("cycle cancelled")]
    Cancelled,
    #[error("subscriber failed")]
    Subscriber(#[source] anyhow::Error),
}

impl CycleError {
    /// Whether the same cycle could succeed on the next attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ProtocolViolation(_))
    }
}

use std::collections::hash_map;
use std::sync::Arc;

use parking_lot::Mutex;
use shardscan_block_util::block::{BlockIdExt, ShardBoundary};
use shardscan_util::FastHashMap;
use shardscan_util::metrics::HistogramGuard;
use tokio_util::sync::CancellationToken;
use tycho_types::models::{BlockId, BlockIdShort};

use super::error::{CycleError, ProtocolViolation};
use super::with_cancel;
use crate::ledger::{LedgerClient, check_prev_blocks};

/// Blocks collected during one cycle, shared by all shard walks.
#[derive(Default)]
pub struct VisitedBlocks {
    inner: Mutex<VisitedBlocksInner>,
}

#[derive(Default)]
struct VisitedBlocksInner {
    ids: FastHashMap<BlockIdShort, BlockId>,
    blocks: Vec<BlockId>,
}

impl VisitedBlocks {
    /// Returns `false` if the block was already collected.
    pub fn insert(&self, block_id: &BlockId) -> Result<bool, ProtocolViolation> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.ids.entry(block_id.as_short_id()) {
            hash_map::Entry::Vacant(entry) => {
                entry.insert(*block_id);
                inner.blocks.push(*block_id);
                Ok(true)
            }
            hash_map::Entry::Occupied(entry) if entry.get().same_hashes(block_id) => Ok(false),
            hash_map::Entry::Occupied(entry) => Err(ProtocolViolation::HashMismatch {
                known: *entry.get(),
                found: *block_id,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns collected blocks in insertion order and resets the set.
    pub fn take_blocks(&self) -> Vec<BlockId> {
        let mut inner = self.inner.lock();
        inner.ids.clear();
        std::mem::take(&mut inner.blocks)
    }
}

/// Walks a shard chain backwards following the first parent.
#[derive(Clone)]
pub struct ShardWalker<L> {
    ledger: L,
    visited: Arc<VisitedBlocks>,
    max_depth: usize,
    cancel: CancellationToken,
}

impl<L: LedgerClient> ShardWalker<L> {
    pub fn new(
        ledger: L,
        visited: Arc<VisitedBlocks>,
        max_depth: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ledger,
            visited,
            max_depth: std::cmp::max(max_depth, 1),
            cancel,
        }
    }

    /// Collects blocks starting from `root` (inclusive).
    ///
    /// Stops at the first block covered by the `boundary` (excluded),
    /// at a block without parents, or at a block collected by another walk.
    pub async fn walk(
        &self,
        root: BlockId,
        boundary: &ShardBoundary,
    ) -> Result<Vec<BlockId>, CycleError> {
        let _histogram = HistogramGuard::begin("shardscan_shard_walk_time");

        let mut result = Vec::new();
        let mut block_id = root;
        loop {
            if boundary.contains(&block_id) {
                break;
            }

            if result.len() >= self.max_depth {
                return Err(ProtocolViolation::ShardWalkTooDeep {
                    root,
                    max_depth: self.max_depth,
                }
                .into());
            }

            if !self.visited.insert(&block_id)? {
                tracing::debug!(%root, %block_id, "shard walk converged");
                break;
            }
            result.push(block_id);

            let prev_blocks =
                with_cancel(&self.cancel, self.ledger.get_prev_blocks(&block_id)).await?;
            check_prev_blocks(&block_id, &prev_blocks)?;
            match prev_blocks.first() {
                Some(parent) => block_id = *parent,
                None => break,
            }
        }

        tracing::debug!(%root, collected = result.len(), "shard walk finished");
        Ok(result)
    }
}

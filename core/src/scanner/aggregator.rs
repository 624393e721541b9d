use std::sync::Arc;

use shardscan_block_util::block::ShardBoundary;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tycho_types::models::BlockId;

use super::config::ScannerConfig;
use super::error::{CycleError, ProtocolViolation};
use super::shard_walker::{ShardWalker, VisitedBlocks};
use super::with_cancel;
use crate::ledger::LedgerClient;

/// Collects shard blocks for a sequence of masterchain blocks.
///
/// Masterchain blocks are processed one by one, shards of each of them
/// are walked concurrently. The first error aborts all walks.
pub struct Aggregator<L> {
    ledger: Arc<L>,
    workchain: i32,
    max_shard_walk_depth: usize,
    walk_permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl<L: LedgerClient> Aggregator<L> {
    pub fn new(
        ledger: Arc<L>,
        config: &ScannerConfig,
        walk_permits: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ledger,
            workchain: config.workchain,
            max_shard_walk_depth: config.max_shard_walk_depth,
            walk_permits,
            cancel,
        }
    }

    /// Returns unique shard blocks produced after `prev_mc_block_id`
    /// up to the last of `mc_block_ids` (which must be ascending).
    pub async fn collect(
        &self,
        mc_block_ids: &[BlockId],
        prev_mc_block_id: &BlockId,
    ) -> Result<Vec<BlockId>, CycleError> {
        let visited = Arc::new(VisitedBlocks::default());

        let mut prev_tops = self.get_shards(prev_mc_block_id).await?;
        for mc_block_id in mc_block_ids {
            debug_assert!(mc_block_id.seqno > prev_mc_block_id.seqno);

            let tops = self.get_shards(mc_block_id).await?;
            let boundary = Arc::new(ShardBoundary::from_tops(&prev_tops));
            self.walk_shards(mc_block_id, &tops, boundary, &visited).await?;
            prev_tops = tops;
        }

        Ok(visited.take_blocks())
    }

    async fn get_shards(&self, mc_block_id: &BlockId) -> Result<Vec<BlockId>, CycleError> {
        let mut shards = with_cancel(&self.cancel, self.ledger.get_shards(mc_block_id)).await?;
        shards.retain(|id| id.shard.workchain() == self.workchain);
        if shards.is_empty() {
            return Err(ProtocolViolation::NoShards {
                mc_block_id: *mc_block_id,
                workchain: self.workchain,
            }
            .into());
        }
        Ok(shards)
    }

    async fn walk_shards(
        &self,
        mc_block_id: &BlockId,
        tops: &[BlockId],
        boundary: Arc<ShardBoundary>,
        visited: &Arc<VisitedBlocks>,
    ) -> Result<(), CycleError> {
        let mut tasks = JoinSet::new();
        for top in tops {
            if boundary.contains(top) {
                tracing::debug!(%mc_block_id, top_block_id = %top, "shard has no new blocks");
                continue;
            }

            let walker = ShardWalker::new(
                self.ledger.clone(),
                visited.clone(),
                self.max_shard_walk_depth,
                self.cancel.clone(),
            );
            let walk_permits = self.walk_permits.clone();
            let boundary = boundary.clone();
            let root = *top;
            tasks.spawn(async move {
                let _permit = walk_permits
                    .acquire_owned()
                    .await
                    .map_err(|_e| CycleError::Cancelled)?;
                walker.walk(root, &boundary).await
            });
        }

        let walks = tasks.len();
        loop {
            let res = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CycleError::Cancelled),
                res = tasks.join_next() => res,
            };

            match res {
                None => break,
                Some(Ok(Ok(_))) => {}
                // NOTE: Remaining walks are aborted when `tasks` is dropped
                Some(Ok(Err(e))) => return Err(e),
                Some(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Some(Err(_)) => return Err(CycleError::Cancelled),
            }
        }

        tracing::debug!(%mc_block_id, walks, collected = visited.len(), "shards walked");
        Ok(())
    }
}

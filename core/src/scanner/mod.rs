use std::future::Future;
use std::sync::Arc;

use shardscan_block_util::block::sort_blocks_desc;
use shardscan_util::metrics::HistogramGuard;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tycho_types::models::BlockId;

pub use self::aggregator::Aggregator;
pub use self::config::ScannerConfig;
pub use self::error::{CycleError, ProtocolViolation};
pub use self::mc_delta::{McDelta, collect_mc_delta};
pub use self::scheduler::{ScannerState, Scheduler, SchedulerStatus, TickOutcome};
pub use self::shard_walker::{ShardWalker, VisitedBlocks};
#[cfg(any(test, feature = "test"))]
pub use self::subscriber::{CollectSubscriber, CollectedBatch};
pub use self::subscriber::{BlocksSubscriber, LogSubscriber, NewBlocksContext, NoopSubscriber};
use crate::ledger::{LedgerClient, LedgerError};

mod aggregator;
mod config;
mod error;
mod mc_delta;
mod scheduler;
mod shard_walker;
mod subscriber;

#[derive(Debug, Clone)]
pub struct CycleInput {
    /// Last fully processed masterchain block.
    pub cursor: Option<BlockId>,
    /// Masterchain block to scan up to. The latest one is used if not set.
    pub target: Option<BlockId>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutput {
    /// New masterchain blocks, sorted in descending order.
    pub mc_blocks: Vec<BlockId>,
    /// New shard blocks, sorted in descending order.
    pub new_blocks: Vec<BlockId>,
    /// Masterchain block which was scanned up to.
    pub target: BlockId,
    pub new_cursor: BlockId,
    pub status: CycleStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// The first cycle, only the cursor was set.
    Initialized,
    /// All blocks up to the target were collected.
    Complete,
    /// The target is too far from the cursor. Nothing was collected,
    /// blocks up to `resume_from` must be scanned first.
    Truncated { resume_from: BlockId },
}

/// Finds blocks produced between the cursor and the target.
pub struct BlockScanner<L> {
    ledger: Arc<L>,
    config: ScannerConfig,
    walk_permits: Arc<Semaphore>,
}

impl<L: LedgerClient> BlockScanner<L> {
    pub fn new(ledger: L, config: ScannerConfig) -> Self {
        let walk_permits = std::cmp::max(config.max_concurrent_walks, 1);
        Self {
            ledger: Arc::new(ledger),
            config,
            walk_permits: Arc::new(Semaphore::new(walk_permits)),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub async fn run_cycle(&self, input: &CycleInput) -> Result<CycleOutput, CycleError> {
        let histogram = HistogramGuard::begin("shardscan_cycle_time");
        let cancel = &input.cancel;

        let Some(cursor) = input.cursor else {
            let head = with_cancel(cancel, self.ledger.get_head()).await?;
            tracing::info!(%head, "scanner initialized");
            return Ok(CycleOutput {
                mc_blocks: Vec::new(),
                new_blocks: Vec::new(),
                target: head,
                new_cursor: head,
                status: CycleStatus::Initialized,
            });
        };

        let target = match input.target {
            Some(target) => target,
            None => with_cancel(cancel, self.ledger.get_head()).await?,
        };

        let delta = {
            let _histogram = HistogramGuard::begin("shardscan_mc_delta_time");
            collect_mc_delta(
                self.ledger.as_ref(),
                &target,
                &cursor,
                self.config.max_delta,
                cancel,
            )
            .await?
        };

        if let Some(resume_from) = delta.truncated {
            tracing::info!(
                %cursor,
                %target,
                %resume_from,
                collected = delta.blocks.len(),
                "masterchain delta truncated",
            );
            return Ok(CycleOutput {
                mc_blocks: Vec::new(),
                new_blocks: Vec::new(),
                target,
                new_cursor: cursor,
                status: CycleStatus::Truncated { resume_from },
            });
        }

        if delta.is_empty() {
            tracing::debug!(%cursor, %target, "no new masterchain blocks");
            return Ok(CycleOutput {
                mc_blocks: Vec::new(),
                new_blocks: Vec::new(),
                target,
                new_cursor: cursor,
                status: CycleStatus::Complete,
            });
        }

        let aggregator = Aggregator::new(
            self.ledger.clone(),
            &self.config,
            self.walk_permits.clone(),
            cancel.clone(),
        );
        let mut new_blocks = aggregator.collect(&delta.blocks, &cursor).await?;
        sort_blocks_desc(&mut new_blocks);

        let mut mc_blocks = delta.blocks;
        mc_blocks.reverse();

        tracing::info!(
            %cursor,
            %target,
            mc_blocks = mc_blocks.len(),
            new_blocks = new_blocks.len(),
            elapsed = ?histogram.finish(),
            "scan cycle complete",
        );

        Ok(CycleOutput {
            mc_blocks,
            new_blocks,
            target,
            new_cursor: target,
            status: CycleStatus::Complete,
        })
    }
}

/// Runs a ledger request until it completes or the token is cancelled.
pub(crate) async fn with_cancel<F, T>(cancel: &CancellationToken, f: F) -> Result<T, CycleError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CycleError::Cancelled),
        res = f => res.map_err(CycleError::from),
    }
}

#[cfg(test)]
mod tests {
    use tycho_types::models::ShardIdent;

    use super::*;
    use crate::ledger::{TestChainBuilder, TestLedger};

    fn input(cursor: Option<BlockId>, target: Option<BlockId>) -> CycleInput {
        CycleInput {
            cursor,
            target,
            cancel: CancellationToken::new(),
        }
    }

    fn scanner(ledger: &Arc<TestLedger>, config: ScannerConfig) -> BlockScanner<Arc<TestLedger>> {
        BlockScanner::new(ledger.clone(), config)
    }

    #[tokio::test]
    async fn first_cycle_only_initializes() {
        let mut builder = TestChainBuilder::new();
        let head = builder.next_mc_blocks(5, 2);
        let ledger = Arc::new(TestLedger::new(&builder));

        let output = scanner(&ledger, Default::default())
            .run_cycle(&input(None, None))
            .await
            .unwrap();
        assert_eq!(output.status, CycleStatus::Initialized);
        assert_eq!(output.new_cursor, head);
        assert!(output.new_blocks.is_empty());
        assert_eq!(ledger.calls().prev_blocks, 0);
    }

    #[tokio::test]
    async fn delta_is_reported_in_descending_order() {
        shardscan_util::test::init_logger("delta_is_reported_in_descending_order", "debug");

        let mut builder = TestChainBuilder::new();
        builder.next_mc_blocks(3, 1);
        let ledger = Arc::new(TestLedger::new(&builder));
        let mc = |seqno| builder.block(ShardIdent::MASTERCHAIN, seqno).unwrap();

        let output = scanner(&ledger, Default::default())
            .run_cycle(&input(Some(mc(1)), None))
            .await
            .unwrap();
        assert_eq!(output.status, CycleStatus::Complete);
        assert_eq!(output.mc_blocks, vec![mc(3), mc(2)]);
        assert_eq!(output.new_cursor, mc(3));
        assert_eq!(
            output.new_blocks,
            vec![
                builder.block(ShardIdent::BASECHAIN, 3).unwrap(),
                builder.block(ShardIdent::BASECHAIN, 2).unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn unchanged_head_keeps_cursor() {
        let mut builder = TestChainBuilder::new();
        let head = builder.next_mc_blocks(3, 1);
        let ledger = Arc::new(TestLedger::new(&builder));

        let output = scanner(&ledger, Default::default())
            .run_cycle(&input(Some(head), None))
            .await
            .unwrap();
        assert_eq!(output.status, CycleStatus::Complete);
        assert_eq!(output.new_cursor, head);
        assert!(output.mc_blocks.is_empty());
        assert!(output.new_blocks.is_empty());
        assert_eq!(ledger.calls().shards, 0);
    }

    #[tokio::test]
    async fn truncated_cycle_collects_nothing() {
        let mut builder = TestChainBuilder::new();
        let cursor = builder.next_mc_block();
        builder.next_mc_blocks(10, 1);
        let ledger = Arc::new(TestLedger::new(&builder));

        let config = ScannerConfig {
            max_delta: 3,
            ..Default::default()
        };
        let output = scanner(&ledger, config)
            .run_cycle(&input(Some(cursor), None))
            .await
            .unwrap();
        assert_eq!(output.status, CycleStatus::Truncated {
            resume_from: builder.block(ShardIdent::MASTERCHAIN, 8).unwrap(),
        });
        assert_eq!(output.new_cursor, cursor);
        assert_eq!(output.target, builder.mc_head());
        assert!(output.new_blocks.is_empty());
        assert_eq!(ledger.calls().shards, 0);
    }

    #[tokio::test]
    async fn explicit_target_is_used() {
        let mut builder = TestChainBuilder::new();
        let cursor = builder.next_mc_block();
        let target = builder.next_mc_blocks(2, 1);
        builder.next_mc_blocks(2, 1);
        let ledger = Arc::new(TestLedger::new(&builder));

        let output = scanner(&ledger, Default::default())
            .run_cycle(&input(Some(cursor), Some(target)))
            .await
            .unwrap();
        assert_eq!(output.new_cursor, target);
        assert_eq!(
            output.new_blocks,
            builder.produced_between(&cursor, &target, 0)
        );
        assert_eq!(ledger.calls().head, 0);
    }

    #[tokio::test]
    async fn failed_cycle_is_retried_with_the_same_result() {
        let mut builder = TestChainBuilder::new();
        let (left, right) = builder.split(&ShardIdent::BASECHAIN);
        let cursor = builder.next_mc_block();
        builder.add_shard_blocks(&left, 2);
        builder.add_shard_blocks(&right, 3);
        builder.next_mc_blocks(2, 1);
        let ledger = Arc::new(TestLedger::new(&builder));

        let expected = scanner(&ledger, Default::default())
            .run_cycle(&input(Some(cursor), None))
            .await
            .unwrap();

        ledger.fail_on(&builder.shard_top(&right));
        let scanner = scanner(&ledger, Default::default());
        let err = scanner
            .run_cycle(&input(Some(cursor), None))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        ledger.clear_failures();
        let output = scanner
            .run_cycle(&input(Some(cursor), None))
            .await
            .unwrap();
        assert_eq!(output, expected);
    }
}

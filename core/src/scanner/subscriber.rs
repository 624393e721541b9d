use std::sync::Arc;

use async_trait::async_trait;
use shardscan_block_util::block::BlockIdExt;
use tycho_types::models::BlockId;

#[cfg(any(test, feature = "test"))]
pub use self::test::{CollectSubscriber, CollectedBatch};

pub struct NewBlocksContext<'a> {
    /// Cursor before the cycle.
    pub prev_cursor: &'a BlockId,
    /// Cursor which will be committed after all subscribers succeed.
    pub new_cursor: &'a BlockId,
    /// New masterchain blocks, sorted in descending order.
    pub mc_blocks: &'a [BlockId],
    /// New shard blocks, sorted in descending order.
    pub blocks: &'a [BlockId],
}

/// Downstream consumer of discovered blocks.
///
/// An error fails the whole cycle and the same blocks will be
/// delivered again on the next one.
#[async_trait]
pub trait BlocksSubscriber: Send + Sync + 'static {
    async fn handle_new_blocks(&self, cx: &NewBlocksContext<'_>) -> anyhow::Result<()>;
}

#[async_trait]
impl<T: BlocksSubscriber + ?Sized> BlocksSubscriber for Box<T> {
    async fn handle_new_blocks(&self, cx: &NewBlocksContext<'_>) -> anyhow::Result<()> {
        T::handle_new_blocks(self, cx).await
    }
}

#[async_trait]
impl<T: BlocksSubscriber + ?Sized> BlocksSubscriber for Arc<T> {
    async fn handle_new_blocks(&self, cx: &NewBlocksContext<'_>) -> anyhow::Result<()> {
        T::handle_new_blocks(self, cx).await
    }
}

#[async_trait]
impl<T1: BlocksSubscriber, T2: BlocksSubscriber> BlocksSubscriber for (T1, T2) {
    async fn handle_new_blocks(&self, cx: &NewBlocksContext<'_>) -> anyhow::Result<()> {
        self.0.handle_new_blocks(cx).await?;
        self.1.handle_new_blocks(cx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NoopSubscriber;

#[async_trait]
impl BlocksSubscriber for NoopSubscriber {
    async fn handle_new_blocks(&self, _cx: &NewBlocksContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs every new shard block.
#[derive(Debug, Clone, Copy)]
pub struct LogSubscriber;

#[async_trait]
impl BlocksSubscriber for LogSubscriber {
    async fn handle_new_blocks(&self, cx: &NewBlocksContext<'_>) -> anyhow::Result<()> {
        tracing::info!(
            prev_cursor = %cx.prev_cursor,
            new_cursor = %cx.new_cursor,
            mc_blocks = cx.mc_blocks.len(),
            blocks = cx.blocks.len(),
            "new blocks",
        );
        for block_id in cx.blocks {
            tracing::info!(
                workchain = block_id.shard.workchain(),
                shard = block_id.signed_shard(),
                seqno = block_id.seqno,
                "new block",
            );
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test"))]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CollectedBatch {
        pub prev_cursor: BlockId,
        pub new_cursor: BlockId,
        pub mc_blocks: Vec<BlockId>,
        pub blocks: Vec<BlockId>,
    }

    /// Remembers everything it receives.
    #[derive(Default)]
    pub struct CollectSubscriber {
        batches: Mutex<Vec<CollectedBatch>>,
        fail: AtomicBool,
    }

    impl CollectSubscriber {
        pub fn batches(&self) -> Vec<CollectedBatch> {
            self.batches.lock().clone()
        }

        /// All received shard blocks in delivery order.
        pub fn all_blocks(&self) -> Vec<BlockId> {
            self.batches
                .lock()
                .iter()
                .flat_map(|batch| batch.blocks.iter().copied())
                .collect()
        }

        /// Makes the subscriber reject all batches.
        pub fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::Release);
        }
    }

    #[async_trait]
    impl BlocksSubscriber for CollectSubscriber {
        async fn handle_new_blocks(&self, cx: &NewBlocksContext<'_>) -> anyhow::Result<()> {
            anyhow::ensure!(!self.fail.load(Ordering::Acquire), "simulated subscriber failure");

            self.batches.lock().push(CollectedBatch {
                prev_cursor: *cx.prev_cursor,
                new_cursor: *cx.new_cursor,
                mc_blocks: cx.mc_blocks.to_vec(),
                blocks: cx.blocks.to_vec(),
            });
            Ok(())
        }
    }
}

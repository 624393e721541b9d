use shardscan_block_util::block::BlockIdExt;
use tokio_util::sync::CancellationToken;
use tycho_types::models::BlockId;

use super::error::{CycleError, ProtocolViolation};
use super::with_cancel;
use crate::ledger::LedgerClient;

/// Masterchain blocks produced after the cursor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct McDelta {
    /// Collected blocks in ascending seqno order.
    pub blocks: Vec<BlockId>,
    /// Set when the limit was reached before the cursor.
    /// Contains the next block to collect (the parent of the oldest one).
    pub truncated: Option<BlockId>,
}

impl McDelta {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Walks the masterchain backwards from `current` to `previous` (excluded).
pub async fn collect_mc_delta<L>(
    ledger: &L,
    current: &BlockId,
    previous: &BlockId,
    max_delta: usize,
    cancel: &CancellationToken,
) -> Result<McDelta, CycleError>
where
    L: LedgerClient + ?Sized,
{
    if current.seqno < previous.seqno {
        tracing::warn!(%current, %previous, "masterchain head is behind the cursor");
        return Ok(McDelta::default());
    } else if current.seqno == previous.seqno {
        return if current.same_hashes(previous) {
            Ok(McDelta::default())
        } else {
            Err(ProtocolViolation::McChainMismatch {
                expected: *previous,
                found: *current,
            }
            .into())
        };
    }

    let max_delta = std::cmp::max(max_delta, 1);

    let mut blocks = Vec::new();
    let mut truncated = None;
    let mut block_id = *current;
    loop {
        if blocks.len() >= max_delta {
            truncated = Some(block_id);
            break;
        }
        blocks.push(block_id);

        let prev_blocks = with_cancel(cancel, ledger.get_prev_blocks(&block_id)).await?;
        let parent = match prev_blocks.as_slice() {
            [parent] => *parent,
            [] => return Err(ProtocolViolation::McGenesisReached { block_id }.into()),
            _ => {
                return Err(ProtocolViolation::MultipleMcParents {
                    block_id,
                    count: prev_blocks.len(),
                }
                .into());
            }
        };
        tracing::debug!(%block_id, %parent, "collected masterchain block");

        if parent.seqno > previous.seqno {
            block_id = parent;
        } else if parent == *previous {
            break;
        } else {
            return Err(ProtocolViolation::McChainMismatch {
                expected: *previous,
                found: parent,
            }
            .into());
        }
    }

    blocks.reverse();
    Ok(McDelta { blocks, truncated })
}

#[cfg(test)]
mod tests {
    use tycho_types::models::ShardIdent;

    use super::*;
    use crate::ledger::{PrevBlocks, TestChainBuilder, TestLedger, make_block_id};

    fn mc_chain(len: u32) -> (TestChainBuilder, TestLedger) {
        let mut builder = TestChainBuilder::new();
        builder.next_mc_blocks(len, 1);
        let ledger = TestLedger::new(&builder);
        (builder, ledger)
    }

    fn mc(builder: &TestChainBuilder, seqno: u32) -> BlockId {
        builder.block(ShardIdent::MASTERCHAIN, seqno).unwrap()
    }

    #[tokio::test]
    async fn delta_excludes_cursor() {
        let (builder, ledger) = mc_chain(3);
        let cancel = CancellationToken::new();

        let delta = collect_mc_delta(&ledger, &mc(&builder, 3), &mc(&builder, 1), 100, &cancel)
            .await
            .unwrap();
        assert_eq!(delta.blocks, vec![mc(&builder, 2), mc(&builder, 3)]);
        assert_eq!(delta.truncated, None);
    }

    #[tokio::test]
    async fn same_head_is_empty() {
        let (builder, ledger) = mc_chain(3);
        let cancel = CancellationToken::new();

        let head = builder.mc_head();
        let delta = collect_mc_delta(&ledger, &head, &head, 100, &cancel)
            .await
            .unwrap();
        assert!(delta.is_empty());

        // Stale head
        let delta = collect_mc_delta(&ledger, &mc(&builder, 1), &head, 100, &cancel)
            .await
            .unwrap();
        assert!(delta.is_empty());
        assert_eq!(ledger.calls().prev_blocks, 0);
    }

    #[tokio::test]
    async fn cap_reached() {
        let (builder, ledger) = mc_chain(11);
        let cancel = CancellationToken::new();

        let delta = collect_mc_delta(&ledger, &mc(&builder, 11), &mc(&builder, 1), 3, &cancel)
            .await
            .unwrap();
        assert_eq!(delta.blocks, vec![
            mc(&builder, 9),
            mc(&builder, 10),
            mc(&builder, 11)
        ]);
        assert_eq!(delta.truncated, Some(mc(&builder, 8)));

        // Exactly at the cap
        let delta = collect_mc_delta(&ledger, &mc(&builder, 4), &mc(&builder, 1), 3, &cancel)
            .await
            .unwrap();
        assert_eq!(delta.blocks.len(), 3);
        assert_eq!(delta.truncated, None);
    }

    #[tokio::test]
    async fn multiple_parents_are_rejected() {
        let (builder, ledger) = mc_chain(3);
        let cancel = CancellationToken::new();

        let head = builder.mc_head();
        ledger.set_prev_blocks(
            &head,
            PrevBlocks::from_slice(&[mc(&builder, 2), mc(&builder, 1)]),
        );

        let err = collect_mc_delta(&ledger, &head, &mc(&builder, 0), 100, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CycleError::ProtocolViolation(ProtocolViolation::MultipleMcParents { count: 2, .. })
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn diverged_chain_is_rejected() {
        let (builder, ledger) = mc_chain(3);
        let cancel = CancellationToken::new();

        let mut forked = mc(&builder, 1);
        forked.root_hash = make_block_id(ShardIdent::BASECHAIN, 1).root_hash;

        let err = collect_mc_delta(&ledger, &builder.mc_head(), &forked, 100, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CycleError::ProtocolViolation(ProtocolViolation::McChainMismatch { .. })
        ));

        let err = collect_mc_delta(&ledger, &builder.mc_head(), &BlockId::default(), 100, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CycleError::ProtocolViolation(ProtocolViolation::McChainMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn genesis_is_an_error() {
        let (builder, ledger) = mc_chain(2);
        let cancel = CancellationToken::new();

        let cursor = mc(&builder, 0);
        ledger.set_prev_blocks(&mc(&builder, 1), PrevBlocks::new());

        let err = collect_mc_delta(&ledger, &builder.mc_head(), &cursor, 100, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CycleError::ProtocolViolation(ProtocolViolation::McGenesisReached { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_delta() {
        let (builder, ledger) = mc_chain(3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = collect_mc_delta(&ledger, &builder.mc_head(), &mc(&builder, 0), 100, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::Cancelled));
        assert!(err.is_retryable());
    }
}

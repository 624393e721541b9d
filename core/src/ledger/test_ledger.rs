use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use shardscan_util::{FastHashMap, FastHashSet};
use tycho_types::cell::HashBytes;
use tycho_types::models::{BlockId, BlockIdShort, ShardIdent};

use super::{LedgerClient, LedgerError, PrevBlocks};

/// Builds a deterministic chain of masterchain and shard blocks.
///
/// Shard blocks are only visible to the ledger after they are
/// registered by [`TestChainBuilder::next_mc_block`].
#[derive(Clone)]
pub struct TestChainBuilder {
    mc_top: BlockId,
    shard_tops: Vec<BlockId>,
    split_parents: FastHashMap<ShardIdent, ShardIdent>,
    pending: Vec<BlockId>,
    produced: FastHashMap<u32, Vec<BlockId>>,
    chain: TestChain,
}

impl Default for TestChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestChainBuilder {
    /// Starts from the zerostate with a single full basechain shard.
    pub fn new() -> Self {
        let mc_top = make_block_id(ShardIdent::MASTERCHAIN, 0);
        let shard_top = make_block_id(ShardIdent::BASECHAIN, 0);

        let mut chain = TestChain {
            head: mc_top,
            ..Default::default()
        };
        chain.add_block(mc_top, PrevBlocks::new());
        chain.add_block(shard_top, PrevBlocks::new());
        chain.shards.insert(mc_top.as_short_id(), vec![shard_top]);

        Self {
            mc_top,
            shard_tops: vec![shard_top],
            split_parents: Default::default(),
            pending: Vec::new(),
            produced: Default::default(),
            chain,
        }
    }

    /// Adds a full shard of another workchain starting from the next masterchain block.
    pub fn with_workchain(mut self, workchain: i32) -> Self {
        let shard = ShardIdent::new_full(workchain);
        assert!(
            self.shard_tops.iter().all(|top| top.shard != shard),
            "workchain {workchain} already exists"
        );

        let top = make_block_id(shard, 0);
        self.chain.add_block(top, PrevBlocks::new());
        self.shard_tops.push(top);
        self
    }

    pub fn mc_head(&self) -> BlockId {
        self.mc_top
    }

    pub fn shard_tops(&self) -> &[BlockId] {
        &self.shard_tops
    }

    pub fn shard_top(&self, shard: &ShardIdent) -> BlockId {
        self.shard_tops[self.shard_index(shard)]
    }

    /// Returns any known block of the chain.
    pub fn block(&self, shard: ShardIdent, seqno: u32) -> Option<BlockId> {
        self.chain.blocks.get(&BlockIdShort { shard, seqno }).copied()
    }

    /// Appends `count` blocks to the specified shard.
    pub fn add_shard_blocks(&mut self, shard: &ShardIdent, count: u32) -> &mut Self {
        let index = self.shard_index(shard);
        for _ in 0..count {
            let prev = self.shard_tops[index];
            let next = make_block_id(prev.shard, prev.seqno + 1);
            self.chain.add_block(next, PrevBlocks::from_slice(&[prev]));
            self.shard_tops[index] = next;
            self.pending.push(next);
        }
        self
    }

    /// Appends `count` blocks to every shard of the specified workchain.
    pub fn advance_workchain(&mut self, workchain: i32, count: u32) -> &mut Self {
        let shards = self
            .shard_tops
            .iter()
            .filter(|top| top.shard.workchain() == workchain)
            .map(|top| top.shard)
            .collect::<Vec<_>>();
        for shard in shards {
            self.add_shard_blocks(&shard, count);
        }
        self
    }

    /// Splits the specified shard. Both children reference the old top.
    pub fn split(&mut self, shard: &ShardIdent) -> (ShardIdent, ShardIdent) {
        let index = self.shard_index(shard);
        let prev = self.shard_tops[index];
        let (left, right) = prev.shard.split().expect("shard must be splittable");

        let left_top = make_block_id(left, prev.seqno + 1);
        let right_top = make_block_id(right, prev.seqno + 1);
        self.chain.add_block(left_top, PrevBlocks::from_slice(&[prev]));
        self.chain.add_block(right_top, PrevBlocks::from_slice(&[prev]));
        self.pending.extend([left_top, right_top]);

        self.shard_tops[index] = left_top;
        self.shard_tops.insert(index + 1, right_top);
        self.split_parents.insert(left, prev.shard);
        self.split_parents.insert(right, prev.shard);

        (left, right)
    }

    /// Merges two sibling shards. The merged block references the left top first.
    pub fn merge(&mut self, left: &ShardIdent, right: &ShardIdent) -> ShardIdent {
        let parent = *self.split_parents.get(left).expect("unknown left shard");
        assert_eq!(self.split_parents.get(right), Some(&parent), "not siblings");

        let left_top = self.shard_top(left);
        let right_top = self.shard_top(right);
        let merged = make_block_id(parent, std::cmp::max(left_top.seqno, right_top.seqno) + 1);
        self.chain
            .add_block(merged, PrevBlocks::from_slice(&[left_top, right_top]));
        self.pending.push(merged);

        let index = self.shard_index(left);
        self.shard_tops[index] = merged;
        self.shard_tops.retain(|top| top.shard != *right);

        merged.shard
    }

    /// Produces the next masterchain block which registers current shard tops.
    pub fn next_mc_block(&mut self) -> BlockId {
        let prev = self.mc_top;
        let next = make_block_id(ShardIdent::MASTERCHAIN, prev.seqno + 1);
        self.chain.add_block(next, PrevBlocks::from_slice(&[prev]));
        self.chain
            .shards
            .insert(next.as_short_id(), self.shard_tops.clone());
        self.produced
            .insert(next.seqno, std::mem::take(&mut self.pending));
        self.chain.head = next;
        self.mc_top = next;
        next
    }

    /// Produces `count` masterchain blocks, advancing every shard before each one.
    pub fn next_mc_blocks(&mut self, count: u32, shard_blocks_per_mc: u32) -> BlockId {
        for _ in 0..count {
            let workchains = self
                .shard_tops
                .iter()
                .map(|top| top.shard.workchain())
                .collect::<FastHashSet<_>>();
            for workchain in workchains {
                self.advance_workchain(workchain, shard_blocks_per_mc);
            }
            self.next_mc_block();
        }
        self.mc_top
    }

    /// Shard blocks produced after `from` and registered up to `to` (inclusive).
    pub fn produced_between(&self, from: &BlockId, to: &BlockId, workchain: i32) -> Vec<BlockId> {
        let mut result = (from.seqno + 1..=to.seqno)
            .filter_map(|seqno| self.produced.get(&seqno))
            .flatten()
            .filter(|id| id.shard.workchain() == workchain)
            .copied()
            .collect::<Vec<_>>();
        shardscan_block_util::block::sort_blocks_desc(&mut result);
        result
    }

    fn shard_index(&self, shard: &ShardIdent) -> usize {
        self.shard_tops
            .iter()
            .position(|top| top.shard == *shard)
            .expect("unknown shard")
    }
}

#[derive(Default, Clone)]
struct TestChain {
    head: BlockId,
    blocks: FastHashMap<BlockIdShort, BlockId>,
    prev_blocks: FastHashMap<BlockIdShort, PrevBlocks>,
    shards: FastHashMap<BlockIdShort, Vec<BlockId>>,
}

impl TestChain {
    fn add_block(&mut self, block_id: BlockId, prev: PrevBlocks) {
        let key = block_id.as_short_id();
        self.blocks.insert(key, block_id);
        self.prev_blocks.insert(key, prev);
    }

    fn check_known(&self, block_id: &BlockId) -> Result<BlockIdShort, LedgerError> {
        let key = block_id.as_short_id();
        match self.blocks.get(&key) {
            Some(known) if known == block_id => Ok(key),
            Some(_) => Err(LedgerError::decode(anyhow::anyhow!(
                "block hash mismatch: {block_id}"
            ))),
            None => Err(LedgerError::decode(anyhow::anyhow!(
                "unknown block: {block_id}"
            ))),
        }
    }
}

/// In-memory ledger backed by a [`TestChainBuilder`] snapshot.
#[derive(Default)]
pub struct TestLedger {
    chain: RwLock<TestChain>,
    failures: Mutex<Failures>,
    delays: Mutex<Delays>,
    head_calls: AtomicUsize,
    shards_calls: AtomicUsize,
    prev_blocks_calls: AtomicUsize,
}

#[derive(Default)]
struct Failures {
    head: bool,
    blocks: FastHashSet<BlockIdShort>,
}

#[derive(Default)]
struct Delays {
    default: Option<Duration>,
    blocks: FastHashMap<BlockIdShort, Duration>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TestLedgerCalls {
    pub head: usize,
    pub shards: usize,
    pub prev_blocks: usize,
}

impl TestLedger {
    pub fn new(builder: &TestChainBuilder) -> Self {
        Self {
            chain: RwLock::new(builder.chain.clone()),
            ..Default::default()
        }
    }

    /// Replaces the chain snapshot (e.g. after new blocks were produced).
    pub fn update(&self, builder: &TestChainBuilder) {
        *self.chain.write() = builder.chain.clone();
    }

    /// Overrides the head returned by the ledger.
    pub fn set_head(&self, head: BlockId) {
        self.chain.write().head = head;
    }

    /// Overrides parents of the specified block.
    pub fn set_prev_blocks(&self, block_id: &BlockId, prev: PrevBlocks) {
        let mut chain = self.chain.write();
        chain.blocks.insert(block_id.as_short_id(), *block_id);
        chain.prev_blocks.insert(block_id.as_short_id(), prev);
    }

    pub fn fail_head(&self, fail: bool) {
        self.failures.lock().head = fail;
    }

    /// All requests about the specified block will fail with a connection error.
    pub fn fail_on(&self, block_id: &BlockId) {
        self.failures.lock().blocks.insert(block_id.as_short_id());
    }

    pub fn clear_failures(&self) {
        *self.failures.lock() = Failures::default();
    }

    /// Delays every request.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.delays.lock().default = delay;
    }

    /// Delays requests about the specified block.
    pub fn set_block_delay(&self, block_id: &BlockId, delay: Duration) {
        self.delays.lock().blocks.insert(block_id.as_short_id(), delay);
    }

    pub fn calls(&self) -> TestLedgerCalls {
        TestLedgerCalls {
            head: self.head_calls.load(Ordering::Acquire),
            shards: self.shards_calls.load(Ordering::Acquire),
            prev_blocks: self.prev_blocks_calls.load(Ordering::Acquire),
        }
    }

    async fn simulate_request(&self, block_id: Option<&BlockId>) -> Result<(), LedgerError> {
        let delay = {
            let delays = self.delays.lock();
            block_id
                .and_then(|id| delays.blocks.get(&id.as_short_id()).copied())
                .or(delays.default)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failures = self.failures.lock();
        let failed = match block_id {
            None => failures.head,
            Some(id) => failures.blocks.contains(&id.as_short_id()),
        };
        if failed {
            return Err(LedgerError::connection(anyhow::anyhow!(
                "simulated connection failure"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for TestLedger {
    async fn get_head(&self) -> Result<BlockId, LedgerError> {
        self.head_calls.fetch_add(1, Ordering::AcqRel);
        self.simulate_request(None).await?;
        Ok(self.chain.read().head)
    }

    async fn get_shards(&self, mc_block_id: &BlockId) -> Result<Vec<BlockId>, LedgerError> {
        self.shards_calls.fetch_add(1, Ordering::AcqRel);
        self.simulate_request(Some(mc_block_id)).await?;

        let chain = self.chain.read();
        let key = chain.check_known(mc_block_id)?;
        chain.shards.get(&key).cloned().ok_or_else(|| {
            LedgerError::decode(anyhow::anyhow!("not a masterchain block: {mc_block_id}"))
        })
    }

    async fn get_prev_blocks(&self, block_id: &BlockId) -> Result<PrevBlocks, LedgerError> {
        self.prev_blocks_calls.fetch_add(1, Ordering::AcqRel);
        self.simulate_request(Some(block_id)).await?;

        let chain = self.chain.read();
        let key = chain.check_known(block_id)?;
        Ok(chain.prev_blocks.get(&key).cloned().unwrap_or_default())
    }
}

/// Deterministic block id for the specified shard and seqno.
pub fn make_block_id(shard: ShardIdent, seqno: u32) -> BlockId {
    let hash = |kind: &[u8]| {
        let mut hasher = Sha256::new();
        hasher.update(kind);
        hasher.update(shard.workchain().to_le_bytes());
        hasher.update(shard.prefix().to_le_bytes());
        hasher.update(seqno.to_le_bytes());
        HashBytes(hasher.finalize().into())
    };

    BlockId {
        shard,
        seqno,
        root_hash: hash(b"root"),
        file_hash: hash(b"file"),
    }
}

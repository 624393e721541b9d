use shardscan_util::FastHashMap;
use tycho_types::models::{BlockId, ShardIdent};

/// Stop boundary for backward shard walks.
///
/// Built from the shard tops registered in the previous anchor block.
/// A walk must not go below (or collect) a block which is covered by it.
#[derive(Debug, Clone)]
pub struct ShardBoundary {
    inner: BoundaryInner,
}

#[derive(Debug, Clone)]
enum BoundaryInner {
    Uniform(u32),
    Tops(FastHashMap<ShardIdent, u32>),
}

impl ShardBoundary {
    /// The same end seqno for every shard.
    pub fn uniform(end_seqno: u32) -> Self {
        Self {
            inner: BoundaryInner::Uniform(end_seqno),
        }
    }

    /// Uses the latest known blocks of each shard.
    pub fn from_tops<'a, I>(tops: I) -> Self
    where
        I: IntoIterator<Item = &'a BlockId>,
    {
        let mut shard_heights = FastHashMap::default();
        for top in tops {
            let seqno = shard_heights.entry(top.shard).or_insert(top.seqno);
            *seqno = std::cmp::max(*seqno, top.seqno);
        }

        Self {
            inner: BoundaryInner::Tops(shard_heights),
        }
    }

    /// Returns the highest known seqno for the specified shard.
    ///
    /// NOTE: Specified shard could be split or merged, so all
    /// intersecting shards are taken into account.
    pub fn end_seqno(&self, shard: &ShardIdent) -> u32 {
        match &self.inner {
            BoundaryInner::Uniform(end_seqno) => *end_seqno,
            BoundaryInner::Tops(shard_heights) => match shard_heights.get(shard) {
                Some(&seqno) => seqno,
                None => shard_heights
                    .iter()
                    .filter(|(top_shard, _)| top_shard.intersects(shard))
                    .map(|(_, &seqno)| seqno)
                    .max()
                    .unwrap_or_default(),
            },
        }
    }

    /// Checks whether the given block is equal to or below the boundary.
    pub fn contains(&self, block_id: &BlockId) -> bool {
        block_id.seqno <= self.end_seqno(&block_id.shard)
    }
}

use std::cmp::Ordering;

use tycho_types::models::BlockId;

pub trait BlockIdExt {
    /// Shard prefix reinterpreted as a signed 64-bit coordinate.
    ///
    /// The full shard `0x8000000000000000` becomes `i64::MIN`.
    fn signed_shard(&self) -> i64;

    /// Returns `true` if both ids point to the same content.
    fn same_hashes(&self, other: &BlockId) -> bool;
}

impl BlockIdExt for BlockId {
    #[inline]
    fn signed_shard(&self) -> i64 {
        self.shard.prefix() as i64
    }

    #[inline]
    fn same_hashes(&self, other: &BlockId) -> bool {
        self.root_hash == other.root_hash && self.file_hash == other.file_hash
    }
}

/// Output order: seqno desc, then signed shard desc, then workchain desc.
pub fn cmp_blocks_desc(a: &BlockId, b: &BlockId) -> Ordering {
    b.seqno
        .cmp(&a.seqno)
        .then_with(|| b.signed_shard().cmp(&a.signed_shard()))
        .then_with(|| b.shard.workchain().cmp(&a.shard.workchain()))
}

pub fn sort_blocks_desc(blocks: &mut [BlockId]) {
    blocks.sort_unstable_by(cmp_blocks_desc);
}

#[cfg(test)]
mod tests {
    use tycho_types::models::ShardIdent;

    use super::*;

    fn block(shard: ShardIdent, seqno: u32) -> BlockId {
        BlockId {
            shard,
            seqno,
            ..Default::default()
        }
    }

    #[test]
    fn full_shard_is_negative() {
        let id = block(ShardIdent::BASECHAIN, 1);
        assert_eq!(id.signed_shard(), i64::MIN);

        let (left, right) = ShardIdent::BASECHAIN.split().unwrap();
        assert_eq!(block(left, 1).signed_shard(), 0x4000_0000_0000_0000);
        assert_eq!(block(right, 1).signed_shard(), 0xc000_0000_0000_0000_u64 as i64);
        assert!(block(right, 1).signed_shard() < 0);
    }

    #[test]
    fn blocks_are_sorted_by_seqno_then_shard() {
        let (left, right) = ShardIdent::BASECHAIN.split().unwrap();

        let mut blocks = vec![
            block(right, 10),
            block(left, 10),
            block(ShardIdent::BASECHAIN, 9),
            block(left, 11),
            block(ShardIdent::MASTERCHAIN, 10),
            block(ShardIdent::BASECHAIN, 10),
        ];
        sort_blocks_desc(&mut blocks);

        let order = blocks
            .iter()
            .map(|id| (id.seqno, id.shard))
            .collect::<Vec<_>>();
        assert_eq!(order, vec![
            (11, left),
            (10, left),
            (10, right),
            // Same prefix, the workchain breaks the tie.
            (10, ShardIdent::BASECHAIN),
            (10, ShardIdent::MASTERCHAIN),
            (9, ShardIdent::BASECHAIN),
        ]);
    }
}

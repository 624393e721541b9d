pub use self::block_id_ext::{BlockIdExt, cmp_blocks_desc, sort_blocks_desc};
pub use self::shard_boundary::ShardBoundary;

mod block_id_ext;
mod shard_boundary;

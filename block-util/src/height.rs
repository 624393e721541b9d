//! Opaque block height used by API clients for pagination.
//!
//! Format: `<shard * 10^16 + seqno>|<root_hash_hex>|<file_hash_hex>`,
//! where `shard` is the signed shard prefix.

use std::str::FromStr;

use tycho_types::cell::HashBytes;
use tycho_types::models::{BlockId, ShardIdent};

use crate::block::BlockIdExt;

pub const SHARD_MULTIPLIER: i128 = 10_000_000_000_000_000;

const SEPARATOR: char = '|';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeight {
    pub shard: i64,
    pub seqno: u32,
    pub root_hash: HashBytes,
    pub file_hash: HashBytes,
}

impl BlockHeight {
    /// Combined shard and seqno.
    pub fn height(&self) -> i128 {
        self.shard as i128 * SHARD_MULTIPLIER + self.seqno as i128
    }

    pub fn to_block_id(&self, workchain: i32) -> Result<BlockId, HeightError> {
        let Some(shard) = ShardIdent::new(workchain, self.shard as u64) else {
            return Err(HeightError::InvalidShard {
                workchain,
                shard: self.shard,
            });
        };

        Ok(BlockId {
            shard,
            seqno: self.seqno,
            root_hash: self.root_hash,
            file_hash: self.file_hash,
        })
    }
}

impl From<&BlockId> for BlockHeight {
    fn from(block_id: &BlockId) -> Self {
        Self {
            shard: block_id.signed_shard(),
            seqno: block_id.seqno,
            root_hash: block_id.root_hash,
            file_hash: block_id.file_hash,
        }
    }
}

impl std::fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.height(),
            hex::encode(self.root_hash.0),
            hex::encode(self.file_hash.0),
        )
    }
}

impl FromStr for BlockHeight {
    type Err = HeightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(SEPARATOR);
        let (Some(height), Some(root_hash), Some(file_hash), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HeightError::InvalidFormat);
        };

        let height = height
            .parse::<i128>()
            .map_err(|_e| HeightError::InvalidHeight(height.to_owned()))?;

        let shard = height.div_euclid(SHARD_MULTIPLIER);
        let seqno = height.rem_euclid(SHARD_MULTIPLIER);

        let shard = i64::try_from(shard).map_err(|_e| HeightError::ShardOutOfRange(shard))?;
        let seqno = u32::try_from(seqno).map_err(|_e| HeightError::SeqnoOutOfRange(seqno))?;

        Ok(Self {
            shard,
            seqno,
            root_hash: parse_hash(root_hash, "root")?,
            file_hash: parse_hash(file_hash, "file")?,
        })
    }
}

fn parse_hash(s: &str, name: &'static str) -> Result<HashBytes, HeightError> {
    let bytes = hex::decode(s).map_err(|source| HeightError::InvalidHash { name, source })?;
    match <[u8; 32]>::try_from(bytes.as_slice()) {
        Ok(hash) => Ok(HashBytes(hash)),
        Err(_) => Err(HeightError::InvalidHashLength {
            name,
            len: bytes.len(),
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HeightError {
    #[error("invalid height format, expected `<height>|<root_hash>|<file_hash>`")]
    InvalidFormat,
    #[error("invalid height number: {0}")]
    InvalidHeight(String),
    #[error("shard out of range: {0}")]
    ShardOutOfRange(i128),
    #[error("seqno out of range: {0}")]
    SeqnoOutOfRange(i128),
    #[error("invalid {name} hash")]
    InvalidHash {
        name: &'static str,
        #[source]
        source: hex::FromHexError,
    },
    #[error("invalid {name} hash length: {len}")]
    InvalidHashLength { name: &'static str, len: usize },
    #[error("invalid shard {shard:016x} for workchain {workchain}")]
    InvalidShard { workchain: i32, shard: i64 },
}

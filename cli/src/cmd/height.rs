use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use shardscan_block_util::height::BlockHeight;
use shardscan_core::ledger::LedgerClient;

use crate::ledger::HttpLedgerClient;
use crate::util::print_json;

/// Print the height of the current shard head.
#[derive(Parser)]
pub struct CmdHeight {
    /// Path to the config. Defaults are used if not set.
    #[clap(long)]
    config: Option<PathBuf>,
}

impl CmdHeight {
    pub fn run(self) -> Result<()> {
        let config = super::load_config(self.config.as_deref())?;
        let workchain = config.scanner.workchain;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;

        rt.block_on(async move {
            let ledger = HttpLedgerClient::new(&config.ledger)?;

            let head = ledger.get_head().await?;
            let shards = ledger.get_shards(&head).await?;
            let Some(block_id) = shards.iter().find(|id| id.shard.workchain() == workchain) else {
                anyhow::bail!("no shards of workchain {workchain} in masterchain block {head}");
            };

            print_json(HeightOutput {
                height: BlockHeight::from(block_id).to_string(),
                block_id: block_id.to_string(),
                mc_block_id: head.to_string(),
            })
        })
    }
}

/// Decompose the height into its components.
#[derive(Parser)]
pub struct CmdDecodeHeight {
    /// Height in `<height>|<root_hash>|<file_hash>` format.
    #[clap(allow_hyphen_values = true)]
    height: String,
}

impl CmdDecodeHeight {
    pub fn run(self) -> Result<()> {
        let height = self
            .height
            .parse::<BlockHeight>()
            .context("invalid height")?;

        print_json(DecodedHeight::from(&height))
    }
}

#[derive(Serialize)]
struct HeightOutput {
    height: String,
    block_id: String,
    mc_block_id: String,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct DecodedHeight {
    #[serde(with = "shardscan_util::serde_helpers::string")]
    shard: i64,
    shard_hex: String,
    seqno: u32,
    root_hash: String,
    file_hash: String,
}

impl From<&BlockHeight> for DecodedHeight {
    fn from(height: &BlockHeight) -> Self {
        Self {
            shard: height.shard,
            shard_hex: format!("{:016x}", height.shard as u64),
            seqno: height.seqno,
            root_hash: height.root_hash.to_string(),
            file_hash: height.file_hash.to_string(),
        }
    }
}

use std::io::Write;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use shardscan_block_util::block::BlockIdExt;
use shardscan_block_util::height::BlockHeight;
use shardscan_core::scanner::{BlocksSubscriber, NewBlocksContext};
use tycho_types::models::BlockId;

/// Prints every new shard block as a JSON line to stdout.
#[derive(Debug, Clone, Copy)]
pub struct JsonSubscriber;

#[async_trait]
impl BlocksSubscriber for JsonSubscriber {
    async fn handle_new_blocks(&self, cx: &NewBlocksContext<'_>) -> Result<()> {
        let mut output = Vec::new();
        write_blocks(&mut output, cx.new_cursor, cx.blocks)?;

        // Stdout may block on a slow consumer
        tokio::task::spawn_blocking(move || {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&output)?;
            stdout.flush()
        })
        .await??;
        Ok(())
    }
}

fn write_blocks<W: Write>(mut writer: W, mc_block_id: &BlockId, blocks: &[BlockId]) -> Result<()> {
    for block_id in blocks {
        let line = BlockLine {
            workchain: block_id.shard.workchain(),
            shard: block_id.signed_shard(),
            seqno: block_id.seqno,
            root_hash: block_id.root_hash.to_string(),
            file_hash: block_id.file_hash.to_string(),
            height: BlockHeight::from(block_id).to_string(),
            mc_seqno: mc_block_id.seqno,
        };
        serde_json::to_writer(&mut writer, &line)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

#[derive(Serialize)]
struct BlockLine {
    workchain: i32,
    #[serde(with = "shardscan_util::serde_helpers::string")]
    shard: i64,
    seqno: u32,
    root_hash: String,
    file_hash: String,
    height: String,
    /// Masterchain block up to which the batch was collected.
    mc_seqno: u32,
}

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::config::AppConfig;

/// Write the default config.
#[derive(Parser)]
pub struct CmdInitConfig {
    /// Path to the output file.
    output: PathBuf,

    /// Overwrite the existing file.
    #[clap(short, long)]
    force: bool,
}

impl CmdInitConfig {
    pub fn run(self) -> Result<()> {
        if self.output.exists() && !self.force {
            anyhow::bail!("config file already exists: {}", self.output.display());
        }
        AppConfig::default().save_to_file(&self.output)
    }
}

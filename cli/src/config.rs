use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use shardscan_core::scanner::ScannerConfig;
use shardscan_util::cli::config::ThreadPoolConfig;
use shardscan_util::cli::logger::LoggerConfig;
use shardscan_util::cli::metrics::MetricsConfig;
use shardscan_util::serde_helpers;

use crate::ledger::HttpLedgerConfig;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scanner: ScannerConfig,

    pub ledger: HttpLedgerConfig,

    /// Prometheus exporter. Disabled if not set.
    pub metrics: Option<MetricsConfig>,

    pub logger_config: LoggerConfig,

    pub threads: ThreadPoolConfig,
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        serde_helpers::load_json_from_file(path)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        serde_helpers::save_json_to_file(self, path)
    }
}

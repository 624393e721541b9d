use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardscan_util::serde_helpers;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Workchain whose shard blocks are collected.
    ///
    /// Default: `0`
    pub workchain: i32,

    /// Interval between scan cycles.
    ///
    /// Default: `5s`
    #[serde(with = "serde_helpers::humantime")]
    pub tick_interval: Duration,

    /// Max masterchain blocks collected in a single cycle.
    ///
    /// Default: `100`
    pub max_delta: usize,

    /// Max shard walks running at the same time.
    ///
    /// Default: `16`
    pub max_concurrent_walks: usize,

    /// Max blocks collected by a single shard walk.
    ///
    /// Default: `1024`
    pub max_shard_walk_depth: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            workchain: 0,
            tick_interval: Duration::from_secs(5),
            max_delta: 100,
            max_concurrent_walks: 16,
            max_shard_walk_depth: 1024,
        }
    }
}

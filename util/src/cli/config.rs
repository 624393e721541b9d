use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Number of tokio worker threads.
    ///
    /// Default: number of available CPUs.
    pub tokio_workers: NonZeroUsize,
}

impl ThreadPoolConfig {
    pub fn build_tokio_runtime(&self) -> std::io::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(self.tokio_workers.get())
            .build()
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            tokio_workers: std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
        }
    }
}

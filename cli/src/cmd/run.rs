use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use shardscan_core::scanner::{BlockScanner, BlocksSubscriber, LogSubscriber, Scheduler};
use shardscan_util::cli::logger::init_logger;
use shardscan_util::cli::metrics::init_metrics;
use shardscan_util::cli::signal;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::ledger::HttpLedgerClient;
use crate::subscriber::JsonSubscriber;

/// Scan new shard blocks until stopped.
#[derive(Parser)]
pub struct CmdRun {
    /// Path to the config. Defaults are used if not set.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Path to the logger targets config.
    #[clap(long)]
    logger_config: Option<PathBuf>,

    /// Print new blocks to stdout as JSON lines.
    #[clap(long)]
    json: bool,
}

impl CmdRun {
    pub fn run(self) -> Result<()> {
        let config = super::load_config(self.config.as_deref())?;
        let rt = config
            .threads
            .build_tokio_runtime()
            .context("failed to build tokio runtime")?;

        rt.block_on(self.run_impl(config))
    }

    async fn run_impl(self, config: AppConfig) -> Result<()> {
        init_logger(&config.logger_config, self.logger_config.as_deref())?;

        if let Some(metrics_config) = &config.metrics {
            init_metrics(metrics_config)?;
        }

        let ledger = HttpLedgerClient::new(&config.ledger)?;
        let subscriber: Arc<dyn BlocksSubscriber> = if self.json {
            Arc::new(JsonSubscriber)
        } else {
            Arc::new(LogSubscriber)
        };

        tracing::info!(
            url = %config.ledger.url,
            workchain = config.scanner.workchain,
            "starting scanner"
        );
        let scheduler = Scheduler::new(BlockScanner::new(ledger, config.scanner), subscriber);

        let cancel = CancellationToken::new();
        let run_fut = scheduler.run(cancel.clone());
        tokio::pin!(run_fut);

        tokio::select! {
            res = &mut run_fut => return res.context("scanner stopped"),
            signal = signal::any_signal(signal::TERMINATION_SIGNALS) => {
                let signal = signal.context("failed to subscribe to signals")?;
                tracing::info!(?signal, "received termination signal");
            }
        }

        // Let the running cycle observe the cancellation
        cancel.cancel();
        run_fut.await.context("scanner stopped")
    }
}

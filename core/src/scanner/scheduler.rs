use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tycho_types::models::BlockId;

use super::error::CycleError;
use super::subscriber::{BlocksSubscriber, NewBlocksContext};
use super::{BlockScanner, CycleInput, CycleStatus};
use crate::ledger::LedgerClient;

/// Progress of the scanner.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScannerState {
    /// Last fully processed masterchain block.
    pub cursor: Option<BlockId>,
    /// Masterchain blocks which must be reached before scanning further.
    ///
    /// Filled when the delta between the cursor and the head is too big.
    /// The top of the stack is the closest target.
    pub pending_targets: Vec<BlockId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Idle,
    Running,
    /// The last cycle failed, the cursor was not changed.
    ///
    /// Kept until the next tick starts a new cycle. The status returns to
    /// `Idle` once a cycle succeeds.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another cycle was in progress.
    Skipped,
    Initialized { cursor: BlockId },
    Complete { cursor: BlockId, new_blocks: usize },
    /// A follow-up cycle is required.
    Truncated { resume_from: BlockId },
}

/// Owns the scanner state and runs scan cycles one at a time.
pub struct Scheduler<L, S> {
    scanner: BlockScanner<L>,
    subscriber: S,
    state: AsyncMutex<ScannerState>,
    status: Mutex<SchedulerStatus>,
}

impl<L: LedgerClient, S: BlocksSubscriber> Scheduler<L, S> {
    pub fn new(scanner: BlockScanner<L>, subscriber: S) -> Self {
        Self::with_state(scanner, subscriber, ScannerState::default())
    }

    pub fn with_state(scanner: BlockScanner<L>, subscriber: S, state: ScannerState) -> Self {
        Self {
            scanner,
            subscriber,
            state: AsyncMutex::new(state),
            status: Mutex::new(SchedulerStatus::Idle),
        }
    }

    pub fn scanner(&self) -> &BlockScanner<L> {
        &self.scanner
    }

    pub fn subscriber(&self) -> &S {
        &self.subscriber
    }

    pub fn status(&self) -> SchedulerStatus {
        *self.status.lock()
    }

    /// Waits for the running cycle (if any) and returns the state snapshot.
    pub async fn state(&self) -> ScannerState {
        self.state.lock().await.clone()
    }

    /// Sets the cursor to the current head unless it is already set.
    pub async fn init(&self, cancel: &CancellationToken) -> Result<(), CycleError> {
        let mut state = self.state.lock().await;
        if state.cursor.is_none() {
            self.run_locked(&mut state, cancel).await?;
        }
        Ok(())
    }

    /// Runs a single cycle unless another one is in progress.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<TickOutcome, CycleError> {
        let Ok(mut state) = self.state.try_lock() else {
            tracing::warn!("previous scan cycle is still running, tick skipped");
            metrics::counter!("shardscan_ticks_skipped_total").increment(1);
            return Ok(TickOutcome::Skipped);
        };
        self.run_locked(&mut state, cancel).await
    }

    /// Runs cycles on every tick until cancelled.
    ///
    /// Fails only if the scanner could not be initialized.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), CycleError> {
        self.init(&cancel).await?;

        let tick_interval = self.scanner.config().tick_interval;
        tracing::info!(?tick_interval, "scheduler started");

        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.reset();

        'outer: loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            // Catch up without waiting for the next tick
            loop {
                let follow_up = match self.run_once(&cancel.child_token()).await {
                    Ok(TickOutcome::Truncated { .. }) => true,
                    Ok(TickOutcome::Complete { .. }) => {
                        !self.state.lock().await.pending_targets.is_empty()
                    }
                    // NOTE: Errors are already reported
                    Ok(_) | Err(_) => false,
                };

                if !follow_up || cancel.is_cancelled() {
                    continue 'outer;
                }
                tracing::debug!("running a follow-up cycle");
            }
        }

        tracing::info!("scheduler stopped");
        Ok(())
    }

    async fn run_locked(
        &self,
        state: &mut ScannerState,
        cancel: &CancellationToken,
    ) -> Result<TickOutcome, CycleError> {
        *self.status.lock() = SchedulerStatus::Running;

        let res = self.run_cycle(state, cancel).await;
        match &res {
            Ok(_) => *self.status.lock() = SchedulerStatus::Idle,
            Err(e) => {
                *self.status.lock() = SchedulerStatus::Failed;
                metrics::counter!("shardscan_cycles_failed_total").increment(1);

                let non_retryable = !e.is_retryable();
                if non_retryable {
                    tracing::error!(
                        non_retryable,
                        cursor = ?state.cursor,
                        "scan cycle failed: {e:?}"
                    );
                } else {
                    tracing::warn!(cursor = ?state.cursor, "scan cycle failed: {e:?}");
                }
            }
        }
        res
    }

    async fn run_cycle(
        &self,
        state: &mut ScannerState,
        cancel: &CancellationToken,
    ) -> Result<TickOutcome, CycleError> {
        let input = CycleInput {
            cursor: state.cursor,
            target: state.pending_targets.last().copied(),
            cancel: cancel.clone(),
        };
        let output = self.scanner.run_cycle(&input).await?;

        let outcome = match (output.status, input.cursor) {
            (CycleStatus::Initialized, _) | (_, None) => {
                state.cursor = Some(output.new_cursor);
                TickOutcome::Initialized {
                    cursor: output.new_cursor,
                }
            }
            (CycleStatus::Truncated { resume_from }, Some(_)) => {
                if input.target.is_none() {
                    state.pending_targets.push(output.target);
                }
                state.pending_targets.push(resume_from);
                TickOutcome::Truncated { resume_from }
            }
            (CycleStatus::Complete, Some(prev_cursor)) => {
                if !output.mc_blocks.is_empty() {
                    let cx = NewBlocksContext {
                        prev_cursor: &prev_cursor,
                        new_cursor: &output.new_cursor,
                        mc_blocks: &output.mc_blocks,
                        blocks: &output.new_blocks,
                    };
                    self.subscriber
                        .handle_new_blocks(&cx)
                        .await
                        .map_err(CycleError::Subscriber)?;
                }

                state.cursor = Some(output.new_cursor);
                if input.target.is_some() {
                    state.pending_targets.pop();
                }

                metrics::counter!("shardscan_new_blocks_total")
                    .increment(output.new_blocks.len() as u64);
                TickOutcome::Complete {
                    cursor: output.new_cursor,
                    new_blocks: output.new_blocks.len(),
                }
            }
        };

        if let Some(cursor) = &state.cursor {
            metrics::gauge!("shardscan_cursor_seqno").set(cursor.seqno as f64);
        }
        metrics::gauge!("shardscan_pending_targets").set(state.pending_targets.len() as f64);

        Ok(outcome)
    }
}

//! Background compaction scheduler
//!
//! A single task wakes up every `flush_interval`, looks at the backlog and
//! compacts old rows at a rate proportional to it:
//!
//! ```text
//! budget = max(min_flush_threshold, pending * interval * flush_speed / MAX_TIMESPAN)
//! ```
//!
//! so a steady backlog is worked off `flush_speed` times faster than rows
//! arrive. Only rows whose base time is at least one row span plus the guard
//! interval in the past are eligible, which keeps compaction away from rows
//! still being written.
//!
//! The loop runs under a supervisor: if it panics it is restarted after
//! `restart_delay`. On shutdown the queue is drained without an age cut-off.

mod flush;
mod retry;

pub use flush::{FlushReport, RowFlusher, RowOutcome};
pub use retry::ErrorPolicy;

use crate::clock::Clock;
use crate::codec::MAX_TIMESPAN;
use crate::compaction::CompactionStats;
use crate::config::CompactionConfig;
use crate::queue::CompactionQueue;
use crate::{BaseTime, Error, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Rows to compact this cycle, `None` when the backlog is too small to bother
pub fn flush_budget(pending: usize, config: &CompactionConfig) -> Option<usize> {
    if pending <= config.min_flush_threshold {
        return None;
    }
    let per_cycle = config.flush_interval_secs as u128 * config.flush_speed as u128;
    let rate = pending as u128 * per_cycle / MAX_TIMESPAN as u128;
    let rate = usize::try_from(rate).unwrap_or(usize::MAX);
    Some(rate.max(config.min_flush_threshold).max(1))
}

/// Newest base time old enough to be compacted at `now_secs`
pub fn cut_off(now_secs: u64, guard_interval_secs: u64) -> BaseTime {
    let cut = now_secs.saturating_sub(MAX_TIMESPAN as u64 + guard_interval_secs);
    BaseTime::try_from(cut).unwrap_or(BaseTime::MAX)
}

/// Drives [`RowFlusher`] from the compaction queue
pub struct CompactionScheduler {
    flusher: Arc<RowFlusher>,
    queue: Arc<CompactionQueue>,
    stats: Arc<CompactionStats>,
    clock: Arc<dyn Clock>,
    config: CompactionConfig,
}

impl CompactionScheduler {
    pub fn new(
        flusher: Arc<RowFlusher>,
        queue: Arc<CompactionQueue>,
        stats: Arc<CompactionStats>,
        clock: Arc<dyn Clock>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            flusher,
            queue,
            stats,
            clock,
            config,
        }
    }

    /// One scheduler wake-up
    pub async fn run_cycle(&self) -> Option<FlushReport> {
        let pending = self.queue.len();
        if pending > self.config.max_pending_rows {
            let discarded = self.queue.discard();
            self.stats.record_discard(discarded);
            error!(
                "Compaction queue exceeded {} rows, discarded {} pending rows; \
                 their cells stay uncompacted",
                self.config.max_pending_rows, discarded
            );
            return None;
        }

        let budget = flush_budget(pending, &self.config)?;
        let cut = cut_off(self.clock.now_secs(), self.config.guard_interval_secs);
        let report = self.flusher.flush(cut, budget).await;
        debug!(
            pending,
            budget,
            cut_off = cut,
            rows = report.rows,
            compacted = report.compacted,
            retried = report.retried,
            "Compaction cycle finished"
        );
        Some(report)
    }

    /// Compact every queued row regardless of age
    pub async fn drain(&self) -> FlushReport {
        let mut total = FlushReport::default();
        for round in 0..self.config.drain_rounds {
            let pending = self.queue.len();
            if pending == 0 {
                break;
            }
            let report = self.flusher.flush(BaseTime::MAX, pending).await;
            debug!(round, pending, rows = report.rows, "Drain round finished");
            total.merge(report);
        }
        total
    }

    /// Force a flush of every row old enough, without a budget
    pub async fn flush_now(&self) -> FlushReport {
        let cut = cut_off(self.clock.now_secs(), self.config.guard_interval_secs);
        self.flusher.flush(cut, self.queue.len()).await
    }

    /// Start the supervised background loop
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.supervise(shutdown.clone()));
        SchedulerHandle { shutdown, task }
    }

    async fn supervise(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting compaction thread (interval {}s, min threshold {})",
            self.config.flush_interval_secs, self.config.min_flush_threshold
        );
        loop {
            let worker = tokio::spawn(Arc::clone(&self).run_loop(shutdown.clone()));
            match worker.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    let delay = self.config.restart_delay();
                    error!("Compaction thread crashed, restarting in {:?}: {}", delay, e);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!("Compaction thread aborted: {}", e);
                    break;
                }
            }
        }

        info!("Flushing compaction queue ({} rows)", self.queue.len());
        let report = self.drain().await;
        info!(
            rows = report.rows,
            compacted = report.compacted,
            remaining = self.queue.len(),
            "Compaction thread stopped"
        );
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.config.flush_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
    }
}

/// Running scheduler
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop, drain the queue and wait for in-flight compactions
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.task
            .await
            .map_err(|e| Error::Internal(format!("compaction scheduler join error: {}", e)))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

//! Store failure handling for scheduled rows
//!
//! A row whose compaction failed is put back in the queue so the next cycle
//! tries again. Backpressure is counted separately and never logged as an
//! error; other failures are logged once per `error_log_every` occurrences.

use super::flush::RowOutcome;
use crate::codec::RowKey;
use crate::compaction::{CompactionStats, StoreOp};
use crate::queue::CompactionQueue;
use crate::StoreError;
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{debug, error};

/// Decides what happens to a row after a failed store call
#[derive(Clone)]
pub struct ErrorPolicy {
    queue: Arc<CompactionQueue>,
    stats: Arc<CompactionStats>,
    log_every: u64,
}

impl ErrorPolicy {
    pub fn new(queue: Arc<CompactionQueue>, stats: Arc<CompactionStats>, log_every: u64) -> Self {
        Self {
            queue,
            stats,
            log_every: log_every.max(1),
        }
    }

    /// Record a failure of `op` on `row` and schedule the row again
    pub fn handle(&self, op: StoreOp, row: &RowKey, err: &StoreError) -> RowOutcome {
        let outcome = if err.is_backpressure() {
            self.stats.record_throttle();
            debug!(%op, "Store throttled compaction, row re-queued");
            RowOutcome::Throttled
        } else {
            let count = self.stats.record_error(op);
            if should_log(count, self.log_every) {
                error!(
                    "Failed to {} row {:02X?} during compaction ({} {} errors so far): {}",
                    op,
                    row.as_bytes(),
                    count,
                    op,
                    err
                );
            }
            RowOutcome::Failed(op)
        };
        self.requeue(row);
        outcome
    }

    /// Schedule `row` again after the task compacting it died
    pub fn handle_task_failure(&self, row: &RowKey, err: &JoinError) -> RowOutcome {
        error!("Compaction task for row {:02X?} failed: {}", row.as_bytes(), err);
        self.requeue(row);
        RowOutcome::Aborted
    }

    fn requeue(&self, row: &RowKey) {
        if let Err(e) = self.queue.add(row) {
            error!("Dropping unschedulable row {:02X?}: {}", row.as_bytes(), e);
        }
    }
}

/// Log the 1st, then every `every`-th occurrence
fn should_log(count: u64, every: u64) -> bool {
    count > 0 && (count - 1) % every == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{IdWidths, SeriesKey};

    fn setup() -> (ErrorPolicy, Arc<CompactionQueue>, Arc<CompactionStats>, RowKey) {
        let queue = Arc::new(CompactionQueue::new(3));
        let stats = Arc::new(CompactionStats::new());
        let policy = ErrorPolicy::new(queue.clone(), stats.clone(), 100);
        let series = SeriesKey::from_ids(&IdWidths::default(), 1, &[(1, 1)]).unwrap();
        (policy, queue, stats, RowKey::new(&series, 3600))
    }

    #[test]
    fn test_backpressure_requeues() {
        let (policy, queue, stats, row) = setup();
        let outcome = policy.handle(StoreOp::Write, &row, &StoreError::Backpressure);
        assert_eq!(outcome, RowOutcome::Throttled);
        assert_eq!(queue.len(), 1);

        let snap = stats.snapshot(queue.len());
        assert_eq!(snap.throttled, 1);
        assert_eq!(snap.write_errors, 0);
    }

    #[test]
    fn test_failures_counted_and_requeued() {
        let (policy, queue, stats, row) = setup();
        for _ in 0..3 {
            let outcome = policy.handle(StoreOp::Delete, &row, &StoreError::Timeout);
            assert_eq!(outcome, RowOutcome::Failed(StoreOp::Delete));
        }
        // Re-adding a pending row is a no-op.
        assert_eq!(queue.len(), 1);
        assert_eq!(stats.snapshot(0).delete_errors, 3);
    }

    #[test]
    fn test_log_cadence() {
        let logged: Vec<u64> = (1..=250).filter(|c| should_log(*c, 100)).collect();
        assert_eq!(logged, vec![1, 101, 201]);
        assert!((1..=5).all(|c| should_log(c, 1)));
        assert!(!should_log(0, 100));
    }
}

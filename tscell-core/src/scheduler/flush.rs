//! Per-row compaction I/O
//!
//! Each row goes through `get → merge → put → delete`. The delete only runs
//! once the merged cell is safely written, so a crash in between leaves a
//! duplicate that the next compaction of the row cleans up.

use super::retry::ErrorPolicy;
use crate::codec::RowKey;
use crate::compaction::{Compaction, Compactor, StoreOp};
use crate::queue::CompactionQueue;
use crate::storage::Store;
use crate::BaseTime;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// What happened to one scheduled row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    /// Merged cell written and/or superseded cells deleted
    Compacted,
    /// Nothing to write
    Unchanged,
    /// Store pushed back; row re-queued
    Throttled,
    /// Store call failed; row re-queued
    Failed(StoreOp),
    /// Compaction task panicked or was cancelled; row re-queued
    Aborted,
}

/// Totals of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub rows: usize,
    pub compacted: usize,
    pub unchanged: usize,
    pub retried: usize,
}

impl FlushReport {
    fn record(&mut self, outcome: RowOutcome) {
        self.rows += 1;
        match outcome {
            RowOutcome::Compacted => self.compacted += 1,
            RowOutcome::Unchanged => self.unchanged += 1,
            RowOutcome::Throttled | RowOutcome::Failed(_) | RowOutcome::Aborted => {
                self.retried += 1
            }
        }
    }

    pub(super) fn merge(&mut self, other: FlushReport) {
        self.rows += other.rows;
        self.compacted += other.compacted;
        self.unchanged += other.unchanged;
        self.retried += other.retried;
    }
}

/// Compacts rows taken from the queue against the store
pub struct RowFlusher {
    store: Arc<dyn Store>,
    family: String,
    compactor: Compactor,
    policy: ErrorPolicy,
    queue: Arc<CompactionQueue>,
    max_concurrent: usize,
}

impl RowFlusher {
    pub fn new(
        store: Arc<dyn Store>,
        family: impl Into<String>,
        compactor: Compactor,
        policy: ErrorPolicy,
        queue: Arc<CompactionQueue>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            family: family.into(),
            compactor,
            policy,
            queue,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn compactor(&self) -> &Compactor {
        &self.compactor
    }

    /// Read, merge and rewrite one row
    pub async fn flush_row(&self, row: RowKey) -> RowOutcome {
        let cells = match self.store.get(&row, &self.family).await {
            Ok(cells) => cells,
            Err(e) => return self.policy.handle(StoreOp::Read, &row, &e),
        };
        let mut annotations = Vec::new();
        let compaction = self.compactor.compact(&cells, &mut annotations);
        self.commit(&row, &compaction).await
    }

    /// Write the merged cell, then delete what it supersedes
    pub async fn commit(&self, row: &RowKey, compaction: &Compaction) -> RowOutcome {
        let Some(merged) = &compaction.merged else {
            return RowOutcome::Unchanged;
        };
        if !compaction.needs_io() {
            return RowOutcome::Unchanged;
        }
        let stats = self.compactor.stats();

        if compaction.write {
            let put = self
                .store
                .put(row, &self.family, merged.qualifier.clone(), merged.value.clone())
                .await;
            if let Err(e) = put {
                return self.policy.handle(StoreOp::Write, row, &e);
            }
            stats.record_write();
        }

        if !compaction.deletes.is_empty() {
            if let Err(e) = self.store.delete(row, &self.family, &compaction.deletes).await {
                return self.policy.handle(StoreOp::Delete, row, &e);
            }
            stats.record_deletes(compaction.deletes.len());
        }

        RowOutcome::Compacted
    }

    /// Compact up to `max` queued rows whose base time is `<= cut_off`.
    ///
    /// Rows are fetched in batches of at most `max_concurrent`; the next batch
    /// is only taken once the previous one settled.
    pub async fn flush(self: &Arc<Self>, cut_off: BaseTime, max: usize) -> FlushReport {
        let mut report = FlushReport::default();
        let mut remaining = max;

        while remaining > 0 {
            let batch_size = remaining.min(self.max_concurrent);
            let rows = self.queue.take_older_than(cut_off, batch_size);
            if rows.is_empty() {
                break;
            }
            let taken = rows.len();
            remaining -= taken;
            report.merge(self.run_batch(rows).await);

            if remaining == 0 || taken < batch_size {
                break;
            }
            debug!(taken, remaining, "Batch capped, asking the store to flush");
            if let Err(e) = self.store.flush().await {
                warn!("Store flush hint failed: {}", e);
            }
        }
        report
    }

    async fn run_batch(self: &Arc<Self>, rows: Vec<RowKey>) -> FlushReport {
        let mut report = FlushReport::default();
        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::with_capacity(rows.len());
        for row in rows {
            let flusher = Arc::clone(self);
            let task_row = row.clone();
            let handle = tasks.spawn(async move { flusher.flush_row(task_row).await });
            in_flight.insert(handle.id(), row);
        }
        while let Some(joined) = tasks.join_next_with_id().await {
            let outcome = match joined {
                Ok((id, outcome)) => {
                    in_flight.remove(&id);
                    outcome
                }
                Err(e) => match in_flight.remove(&e.id()) {
                    Some(row) => self.policy.handle_task_failure(&row, &e),
                    None => {
                        error!("Untracked row compaction task failed: {}", e);
                        continue;
                    }
                },
            };
            report.record(outcome);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_cell, encode_qualifier, encode_row_key, IdWidths, SeriesKey};
    use crate::compaction::{CompactionStats, DuplicatePolicy};
    use crate::storage::MemoryStore;
    use crate::{Cell, PointTime, StoreError, StoreResult, Value};
    use async_trait::async_trait;
    use bytes::Bytes;

    const BASE: u64 = 1_356_998_400;

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<CompactionQueue>,
        stats: Arc<CompactionStats>,
        flusher: Arc<RowFlusher>,
    }

    fn fixture(max_concurrent: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(CompactionQueue::new(3));
        let stats = Arc::new(CompactionStats::new());
        let flusher = Arc::new(RowFlusher::new(
            store.clone(),
            "t",
            Compactor::new(DuplicatePolicy::KeepFirst, stats.clone()),
            ErrorPolicy::new(queue.clone(), stats.clone(), 100),
            queue.clone(),
            max_concurrent,
        ));
        Fixture {
            store,
            queue,
            stats,
            flusher,
        }
    }

    async fn write_points(f: &Fixture, metric: u64, points: u64) -> RowKey {
        let series = SeriesKey::from_ids(&IdWidths::default(), metric, &[(1, 1)]).unwrap();
        let mut key = None;
        for i in 0..points {
            let time = PointTime::Seconds(BASE + i * 7);
            let (row, base) = encode_row_key(&series, time).unwrap();
            let (q, v) = encode_qualifier(time, base, Value::Integer(i as i64)).unwrap();
            f.store.put(&row, "t", q.into(), v.into()).await.unwrap();
            f.queue.add(&row).unwrap();
            key = Some(row);
        }
        key.unwrap()
    }

    #[tokio::test]
    async fn test_flush_row_compacts() {
        let f = fixture(10);
        let row = write_points(&f, 1, 5).await;
        f.queue.take_older_than(BaseTime::MAX, 10);

        assert_eq!(f.flusher.flush_row(row.clone()).await, RowOutcome::Compacted);
        let cells = f.store.cells(&row, "t");
        assert_eq!(cells.len(), 1);
        let points = decode_cell(BASE as u32, &cells[0].qualifier, &cells[0].value).unwrap();
        assert_eq!(points.len(), 5);

        // Second pass finds the row already compacted.
        assert_eq!(f.flusher.flush_row(row).await, RowOutcome::Unchanged);
        let snap = f.stats.snapshot(f.queue.len());
        assert_eq!(snap.written_cells, 1);
        assert_eq!(snap.deleted_cells, 5);
    }

    #[tokio::test]
    async fn test_read_failure_requeues() {
        let f = fixture(10);
        let row = write_points(&f, 1, 3).await;
        f.queue.take_older_than(BaseTime::MAX, 10);
        f.store.fail_next(StoreOp::Read, StoreError::Unavailable("region moved".into()), 1);

        assert_eq!(f.flusher.flush_row(row).await, RowOutcome::Failed(StoreOp::Read));
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.stats.snapshot(0).read_errors, 1);
        assert_eq!(f.store.cell_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_delete_recovers_on_next_pass() {
        let f = fixture(10);
        let row = write_points(&f, 1, 4).await;
        f.queue.take_older_than(BaseTime::MAX, 10);
        f.store.fail_next(StoreOp::Delete, StoreError::Timeout, 1);

        assert_eq!(f.flusher.flush_row(row.clone()).await, RowOutcome::Failed(StoreOp::Delete));
        // Merged cell written next to the four originals.
        assert_eq!(f.store.cells(&row, "t").len(), 5);
        assert_eq!(f.queue.len(), 1);

        let report = f.flusher.flush(BaseTime::MAX, 10).await;
        assert_eq!(report.compacted, 1);
        let cells = f.store.cells(&row, "t");
        assert_eq!(cells.len(), 1);
        let points = decode_cell(BASE as u32, &cells[0].qualifier, &cells[0].value).unwrap();
        assert_eq!(points.len(), 4);
        assert_eq!(f.stats.snapshot(0).duplicates_same, 4);
    }

    #[tokio::test]
    async fn test_throttled_put_keeps_cells() {
        let f = fixture(10);
        let row = write_points(&f, 1, 2).await;
        f.store.throttle_next_puts(1);

        let report = f.flusher.flush(BaseTime::MAX, 10).await;
        assert_eq!(report.retried, 1);
        assert_eq!(f.store.cells(&row, "t").len(), 2);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.stats.snapshot(0).throttled, 1);
    }

    #[tokio::test]
    async fn test_batches_respect_concurrency_cap() {
        let f = fixture(10);
        for metric in 0..35 {
            write_points(&f, metric, 2).await;
        }

        let report = f.flusher.flush(BaseTime::MAX, 35).await;
        assert_eq!(report.rows, 35);
        assert_eq!(report.compacted, 35);
        assert!(f.queue.is_empty());
        // Hint after each of the three full batches that left budget.
        assert_eq!(f.store.ops().flushes, 3);
    }

    #[tokio::test]
    async fn test_budget_limits_rows() {
        let f = fixture(10);
        for metric in 0..30 {
            write_points(&f, metric, 2).await;
        }
        let report = f.flusher.flush(BaseTime::MAX, 12).await;
        assert_eq!(report.rows, 12);
        assert_eq!(f.queue.len(), 18);
    }

    #[tokio::test]
    async fn test_cut_off_skips_recent_rows() {
        let f = fixture(10);
        write_points(&f, 1, 2).await;
        let report = f.flusher.flush(BASE as BaseTime - 1, 10).await;
        assert_eq!(report.rows, 0);
        assert_eq!(f.queue.len(), 1);
    }

    /// Store whose reads blow up inside the compaction task
    struct PanickingStore;

    #[async_trait]
    impl Store for PanickingStore {
        async fn get(&self, _row: &RowKey, _family: &str) -> StoreResult<Vec<Cell>> {
            panic!("corrupt region index");
        }

        async fn put(&self, _row: &RowKey, _family: &str, _q: Bytes, _v: Bytes) -> StoreResult<()> {
            Ok(())
        }

        async fn delete(&self, _row: &RowKey, _family: &str, _qs: &[Bytes]) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_task_requeues_row() {
        let queue = Arc::new(CompactionQueue::new(3));
        let stats = Arc::new(CompactionStats::new());
        let flusher = Arc::new(RowFlusher::new(
            Arc::new(PanickingStore),
            "t",
            Compactor::new(DuplicatePolicy::KeepFirst, stats.clone()),
            ErrorPolicy::new(queue.clone(), stats.clone(), 100),
            queue.clone(),
            10,
        ));
        let series = SeriesKey::from_ids(&IdWidths::default(), 1, &[(1, 1)]).unwrap();
        let row = RowKey::new(&series, BASE as BaseTime);
        queue.add(&row).unwrap();

        let report = flusher.flush(BaseTime::MAX, 10).await;
        assert_eq!(report.rows, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take_older_than(BaseTime::MAX, 10), vec![row]);
    }
}

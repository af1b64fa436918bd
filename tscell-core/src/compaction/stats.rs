//! Compaction counters

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Store operation a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreOp {
    Read,
    Write,
    Delete,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreOp::Read => "read",
            StoreOp::Write => "write",
            StoreOp::Delete => "delete",
        })
    }
}

/// Counters shared by the compactor, the flusher and the scheduler
#[derive(Debug, Default)]
pub struct CompactionStats {
    complex_compactions: AtomicU64,
    duplicates_same: AtomicU64,
    duplicates_different: AtomicU64,
    malformed_cells: AtomicU64,
    written_cells: AtomicU64,
    deleted_cells: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    delete_errors: AtomicU64,
    throttled: AtomicU64,
    discarded_rows: AtomicU64,
}

impl CompactionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_merge(&self) {
        self.complex_compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self, same_value: bool) {
        if same_value {
            self.duplicates_same.fetch_add(1, Ordering::Relaxed);
        } else {
            self.duplicates_different.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed_cells.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.written_cells.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deletes(&self, n: usize) {
        self.deleted_cells.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Count a failed store call and return the running total for that op
    pub(crate) fn record_error(&self, op: StoreOp) -> u64 {
        let counter = match op {
            StoreOp::Read => &self.read_errors,
            StoreOp::Write => &self.write_errors,
            StoreOp::Delete => &self.delete_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_throttle(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discard(&self, rows: usize) {
        self.discarded_rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self, queue_size: usize) -> StatsSnapshot {
        StatsSnapshot {
            queue_size,
            compactions: self.complex_compactions.load(Ordering::Relaxed),
            duplicates_same: self.duplicates_same.load(Ordering::Relaxed),
            duplicates_different: self.duplicates_different.load(Ordering::Relaxed),
            malformed_cells: self.malformed_cells.load(Ordering::Relaxed),
            written_cells: self.written_cells.load(Ordering::Relaxed),
            deleted_cells: self.deleted_cells.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            delete_errors: self.delete_errors.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            discarded_rows: self.discarded_rows.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`CompactionStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Rows waiting in the compaction queue
    pub queue_size: usize,
    /// Rows that went through the heap merge
    pub compactions: u64,
    /// Duplicate points with identical values
    pub duplicates_same: u64,
    /// Duplicate points whose values disagreed
    pub duplicates_different: u64,
    /// Datapoint cells skipped because they could not be decoded
    pub malformed_cells: u64,
    /// Compacted cells written back
    pub written_cells: u64,
    /// Superseded cells deleted
    pub deleted_cells: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub delete_errors: u64,
    /// Rows re-queued because the store pushed back
    pub throttled: u64,
    /// Rows dropped from the queue to relieve memory pressure
    pub discarded_rows: u64,
}

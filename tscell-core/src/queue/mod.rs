//! Pending-compaction queue
//!
//! Every row that receives a write is remembered here until the scheduler
//! takes it for compaction. Entries are ordered by the base time embedded in
//! the row key (then by the full key) so the oldest rows come out first.
//!
//! The set is a lock-free skip list: writers insert concurrently with the
//! scheduler, and removal through a skip list entry succeeds for exactly one
//! caller, which is what keeps two flushes from compacting the same row.

use crate::codec::RowKey;
use crate::{BaseTime, Result};
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use tracing::debug;

/// Ordering key: base time first, then the whole row key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    base_time: BaseTime,
    row: RowKey,
}

/// Ordered set of row keys waiting to be compacted
pub struct CompactionQueue {
    /// Value is the insertion ticket, used to tell a fresh insert from an existing entry
    entries: SkipMap<QueueKey, u64>,
    /// Live entry count; `SkipMap::len` walks the list
    size: AtomicIsize,
    next_ticket: AtomicU64,
    metric_width: usize,
}

impl CompactionQueue {
    /// Create an empty queue for row keys whose metric id is `metric_width` bytes
    pub fn new(metric_width: usize) -> Self {
        Self {
            entries: SkipMap::new(),
            size: AtomicIsize::new(0),
            next_ticket: AtomicU64::new(0),
            metric_width,
        }
    }

    /// Schedule a row for compaction.
    ///
    /// Returns `true` if the row was not already pending.
    pub fn add(&self, row: &RowKey) -> Result<bool> {
        let key = QueueKey {
            base_time: row.base_time(self.metric_width)?,
            row: row.clone(),
        };
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        loop {
            let entry = self.entries.get_or_insert(key.clone(), ticket);
            if *entry.value() == ticket {
                self.size.fetch_add(1, Ordering::AcqRel);
                return Ok(true);
            }
            if !entry.is_removed() {
                return Ok(false);
            }
            // A concurrent take removed the existing entry; insert again.
        }
    }

    /// Remove and return up to `max` rows whose base time is `<= cut_off`,
    /// oldest first.
    pub fn take_older_than(&self, cut_off: BaseTime, max: usize) -> Vec<RowKey> {
        let mut taken = Vec::with_capacity(max.min(self.len()));
        if max == 0 {
            return taken;
        }

        for entry in self.entries.iter() {
            if entry.key().base_time > cut_off {
                break;
            }
            if entry.remove() {
                self.size.fetch_sub(1, Ordering::AcqRel);
                taken.push(entry.key().row.clone());
                if taken.len() == max {
                    break;
                }
            }
        }
        taken
    }

    /// Drop every pending row, returning how many were discarded
    pub fn discard(&self) -> usize {
        let mut discarded = 0;
        while let Some(entry) = self.entries.pop_front() {
            self.size.fetch_sub(1, Ordering::AcqRel);
            discarded += 1;
            drop(entry);
        }
        debug!(discarded, "Cleared compaction queue");
        discarded
    }

    /// Number of pending rows (O(1))
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Base time of the oldest pending row
    pub fn oldest_base_time(&self) -> Option<BaseTime> {
        self.entries.front().map(|e| e.key().base_time)
    }

    pub fn metric_width(&self) -> usize {
        self.metric_width
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{IdWidths, SeriesKey};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn row(metric: u64, base_time: BaseTime) -> RowKey {
        let series = SeriesKey::from_ids(&IdWidths::default(), metric, &[(1, 1)]).unwrap();
        RowKey::new(&series, base_time)
    }

    #[test]
    fn test_add_is_idempotent() {
        let queue = CompactionQueue::new(3);
        assert!(queue.add(&row(1, 3600)).unwrap());
        assert!(!queue.add(&row(1, 3600)).unwrap());
        assert_eq!(queue.len(), 1);

        assert!(queue.add(&row(2, 3600)).unwrap());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_take_orders_by_base_time() {
        let queue = CompactionQueue::new(3);
        // Higher metric id but older base time must come out first.
        queue.add(&row(1, 7200)).unwrap();
        queue.add(&row(9, 3600)).unwrap();
        queue.add(&row(5, 7200)).unwrap();
        queue.add(&row(2, 10800)).unwrap();

        assert_eq!(queue.oldest_base_time(), Some(3600));
        let taken = queue.take_older_than(7200, 10);
        assert_eq!(taken, vec![row(9, 3600), row(1, 7200), row(5, 7200)]);
        assert_eq!(queue.len(), 1);

        assert!(queue.take_older_than(7200, 10).is_empty());
        assert_eq!(queue.take_older_than(BaseTime::MAX, 10), vec![row(2, 10800)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_respects_max() {
        let queue = CompactionQueue::new(3);
        for m in 0..10 {
            queue.add(&row(m, 3600)).unwrap();
        }
        assert_eq!(queue.take_older_than(3600, 4).len(), 4);
        assert_eq!(queue.take_older_than(3600, 0).len(), 0);
        assert_eq!(queue.len(), 6);
    }

    #[test]
    fn test_re_add_after_take() {
        let queue = CompactionQueue::new(3);
        let r = row(1, 3600);
        queue.add(&r).unwrap();
        assert_eq!(queue.take_older_than(3600, 1), vec![r.clone()]);
        assert!(queue.add(&r).unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_discard() {
        let queue = CompactionQueue::new(3);
        for m in 0..25 {
            queue.add(&row(m, 3600 * (m as u32 % 3))).unwrap();
        }
        assert_eq!(queue.discard(), 25);
        assert!(queue.is_empty());
        assert_eq!(queue.oldest_base_time(), None);
    }

    #[test]
    fn test_rejects_short_row_key() {
        let queue = CompactionQueue::new(3);
        assert!(queue.add(&RowKey::from_bytes(vec![1u8, 2, 3])).is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_take_never_duplicates() {
        const WRITERS: usize = 4;
        const TAKERS: usize = 4;
        const ROWS: u64 = 2_000;

        let queue = Arc::new(CompactionQueue::new(3));
        let barrier = Arc::new(Barrier::new(WRITERS + TAKERS));
        let mut writers = Vec::new();
        for w in 0..WRITERS {
            let queue = queue.clone();
            let barrier = barrier.clone();
            writers.push(thread::spawn(move || {
                barrier.wait();
                // Every writer inserts every row, interleaved differently.
                for i in 0..ROWS {
                    let m = (i + w as u64 * 397) % ROWS;
                    queue.add(&row(m, 3600 * (m as u32 % 4))).unwrap();
                }
            }));
        }

        let mut takers = Vec::new();
        for _ in 0..TAKERS {
            let queue = queue.clone();
            let barrier = barrier.clone();
            takers.push(thread::spawn(move || {
                barrier.wait();
                let mut got = Vec::new();
                for _ in 0..200 {
                    got.extend(queue.take_older_than(BaseTime::MAX, 17));
                }
                got
            }));
        }

        for w in writers {
            w.join().unwrap();
        }
        let mut all: Vec<RowKey> = Vec::new();
        for t in takers {
            all.extend(t.join().unwrap());
        }
        // Whatever the takers missed is still queued.
        all.extend(queue.take_older_than(BaseTime::MAX, usize::MAX));
        assert_eq!(queue.len(), 0);

        // A row may come out again if a writer re-added it after a take,
        // but every distinct row must come out at least once.
        let distinct: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(distinct.len(), ROWS as usize);
    }

    #[test]
    fn test_concurrent_add_take_returns_each_row_once() {
        const WRITERS: u64 = 4;
        const TAKERS: usize = 4;
        const ROWS: u64 = 2_000;

        for _ in 0..20 {
            let queue = Arc::new(CompactionQueue::new(3));
            let writers_done = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(WRITERS as usize + TAKERS));

            let writers: Vec<_> = (0..WRITERS)
                .map(|w| {
                    let queue = queue.clone();
                    let barrier = barrier.clone();
                    let writers_done = writers_done.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        // Disjoint key ranges, each added exactly once.
                        for i in 0..ROWS {
                            let m = w * ROWS + i;
                            queue.add(&row(m, 3600 * (m as u32 % 4))).unwrap();
                        }
                        writers_done.fetch_add(1, Ordering::SeqCst);
                    })
                })
                .collect();

            let takers: Vec<_> = (0..TAKERS)
                .map(|_| {
                    let queue = queue.clone();
                    let barrier = barrier.clone();
                    let writers_done = writers_done.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        let mut got = Vec::new();
                        loop {
                            let finished = writers_done.load(Ordering::SeqCst) == WRITERS as usize;
                            let batch = queue.take_older_than(BaseTime::MAX, 13);
                            if batch.is_empty() && finished {
                                break got;
                            }
                            got.extend(batch);
                        }
                    })
                })
                .collect();

            for w in writers {
                w.join().unwrap();
            }
            let mut all = Vec::new();
            for t in takers {
                all.extend(t.join().unwrap());
            }

            let distinct: HashSet<_> = all.iter().cloned().collect();
            assert_eq!(all.len(), (WRITERS * ROWS) as usize);
            assert_eq!(distinct.len(), all.len());
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_concurrent_takers_partition_entries() {
        const TAKERS: usize = 8;
        let queue = Arc::new(CompactionQueue::new(3));
        for m in 0..5_000 {
            queue.add(&row(m, 3600)).unwrap();
        }

        let barrier = Arc::new(Barrier::new(TAKERS));
        let handles: Vec<_> = (0..TAKERS)
            .map(|_| {
                let queue = queue.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut got = Vec::new();
                    loop {
                        let batch = queue.take_older_than(3600, 50);
                        if batch.is_empty() {
                            break got;
                        }
                        got.extend(batch);
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for r in h.join().unwrap() {
                total += 1;
                assert!(seen.insert(r), "row returned to two takers");
            }
        }
        assert_eq!(total, 5_000);
        assert!(queue.is_empty());
    }
}

//! In-memory store with fault injection

use super::Store;
use crate::codec::RowKey;
use crate::compaction::StoreOp;
use crate::{Cell, StoreError, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

type Columns = BTreeMap<Bytes, (Bytes, u64)>;

/// Store backed by ordered maps, for tests and demos
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<(String, Bytes), Columns>>,
    faults: Mutex<HashMap<StoreOp, VecDeque<StoreError>>>,
    write_seq: AtomicU64,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
    closed: AtomicBool,
}

/// Operation counters of a [`MemoryStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreOps {
    pub gets: u64,
    pub puts: u64,
    pub deletes: u64,
    pub flushes: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail with `error`
    pub fn fail_next(&self, op: StoreOp, error: StoreError, times: usize) {
        let mut faults = self.faults.lock();
        let queue = faults.entry(op).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Make the next `times` puts fail with backpressure
    pub fn throttle_next_puts(&self, times: usize) {
        self.fail_next(StoreOp::Write, StoreError::Backpressure, times);
    }

    /// Cells of a row, ordered by qualifier
    pub fn cells(&self, row: &RowKey, family: &str) -> Vec<Cell> {
        let rows = self.rows.read();
        rows.get(&(family.to_string(), row.to_bytes()))
            .map(|columns| to_cells(row, columns))
            .unwrap_or_default()
    }

    /// Number of non-empty rows across all families
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Total number of cells across all rows
    pub fn cell_count(&self) -> usize {
        self.rows.read().values().map(BTreeMap::len).sum()
    }

    pub fn ops(&self) -> StoreOps {
        StoreOps {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check(&self, op: StoreOp) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Unavailable("store is shut down".into()));
        }
        let injected = self.faults.lock().get_mut(&op).and_then(VecDeque::pop_front);
        match injected {
            Some(e) => {
                debug!(%op, error = %e, "Injected store fault");
                Err(e)
            }
            None => Ok(()),
        }
    }
}

fn to_cells(row: &RowKey, columns: &Columns) -> Vec<Cell> {
    columns
        .iter()
        .map(|(q, (v, t))| Cell {
            row: row.to_bytes(),
            qualifier: q.clone(),
            value: v.clone(),
            write_time: *t,
        })
        .collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, row: &RowKey, family: &str) -> StoreResult<Vec<Cell>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.check(StoreOp::Read)?;
        Ok(self.cells(row, family))
    }

    async fn put(
        &self,
        row: &RowKey,
        family: &str,
        qualifier: Bytes,
        value: Bytes,
    ) -> StoreResult<()> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.check(StoreOp::Write)?;
        let write_time = self.write_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut rows = self.rows.write();
        rows.entry((family.to_string(), row.to_bytes()))
            .or_default()
            .insert(qualifier, (value, write_time));
        Ok(())
    }

    async fn delete(&self, row: &RowKey, family: &str, qualifiers: &[Bytes]) -> StoreResult<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.check(StoreOp::Delete)?;
        let key = (family.to_string(), row.to_bytes());
        let mut rows = self.rows.write();
        if let Some(columns) = rows.get_mut(&key) {
            for q in qualifiers {
                columns.remove(q);
            }
            if columns.is_empty() {
                rows.remove(&key);
            }
        }
        Ok(())
    }

    async fn flush(&self) -> StoreResult<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn shutdown(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        debug!(cells = self.cell_count(), "Memory store shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> RowKey {
        RowKey::from_bytes(vec![0u8, 0, 1, 0, 0, 0x0E, 0x10])
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        let row = row();
        for (q, v) in [([0x00, 0x20], 2u8), ([0x00, 0x10], 1)] {
            store
                .put(&row, "t", Bytes::copy_from_slice(&q), Bytes::copy_from_slice(&[v]))
                .await
                .unwrap();
        }

        let cells = store.get(&row, "t").await.unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(&cells[0].qualifier[..], &[0x00, 0x10]);
        assert!(cells[0].write_time > cells[1].write_time);
        assert!(store.get(&row, "other").await.unwrap().is_empty());

        store.delete(&row, "t", &[Bytes::from_static(&[0x00, 0x10])]).await.unwrap();
        assert_eq!(store.cell_count(), 1);
        store.delete(&row, "t", &[Bytes::from_static(&[0x00, 0x20])]).await.unwrap();
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        let row = row();
        store.throttle_next_puts(2);
        store.fail_next(StoreOp::Read, StoreError::Timeout, 1);

        let q = Bytes::from_static(&[0x00, 0x10]);
        let v = Bytes::from_static(&[1]);
        assert_eq!(store.put(&row, "t", q.clone(), v.clone()).await, Err(StoreError::Backpressure));
        assert_eq!(store.put(&row, "t", q.clone(), v.clone()).await, Err(StoreError::Backpressure));
        assert!(store.put(&row, "t", q, v).await.is_ok());

        assert_eq!(store.get(&row, "t").await, Err(StoreError::Timeout));
        assert_eq!(store.get(&row, "t").await.unwrap().len(), 1);
        assert_eq!(store.ops().puts, 3);
        assert_eq!(store.ops().gets, 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_calls() {
        let store = MemoryStore::new();
        store.shutdown().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.get(&row(), "t").await, Err(StoreError::Unavailable(_))));
    }
}

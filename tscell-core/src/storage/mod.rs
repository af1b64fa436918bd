//! Wide-column store collaborator
//!
//! The engine never owns storage; it talks to a store offering per-row
//! get/put/delete over column families. Calls are asynchronous and may fail
//! with [`StoreError::Backpressure`](crate::StoreError::Backpressure) when the
//! store wants the caller to slow down.

mod memory;

pub use memory::{MemoryStore, StoreOps};

use crate::codec::RowKey;
use crate::{Cell, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;

/// Asynchronous wide-column key-value store
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fetch every cell of a row in one family, ordered by qualifier
    async fn get(&self, row: &RowKey, family: &str) -> StoreResult<Vec<Cell>>;

    /// Write one cell, replacing any cell with the same qualifier
    async fn put(&self, row: &RowKey, family: &str, qualifier: Bytes, value: Bytes)
        -> StoreResult<()>;

    /// Delete the given qualifiers of a row; missing qualifiers are ignored
    async fn delete(&self, row: &RowKey, family: &str, qualifiers: &[Bytes]) -> StoreResult<()>;

    /// Hint that buffered writes should be sent now
    async fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Release the store; called once after the last compaction settled
    async fn shutdown(&self) -> StoreResult<()> {
        Ok(())
    }
}

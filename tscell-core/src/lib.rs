//! tscell Core - time-series cells on a wide-column store
//!
//! Stores every data point as a narrow cell and rewrites each row's cells
//! into one compacted cell once the row stops receiving writes.
//!
//! # Architecture
//!
//! - **Codec**: row keys (`metric ‖ base_time ‖ tags`) and column qualifiers
//!   (offset + value flags) for second and millisecond points
//! - **Queue**: lock-free ordered set of rows waiting for compaction
//! - **Compaction**: heap merge of a row's cells with duplicate resolution
//!   and annotation extraction
//! - **Scheduler**: background task compacting old rows at a rate
//!   proportional to the backlog, retrying rows the store pushed back on
//! - **Storage**: the store collaborator trait and an in-memory store

pub mod clock;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod queue;
pub mod scheduler;
pub mod storage;

mod error;
mod types;

pub use engine::{Engine, RowData};
pub use error::{Error, Result, StoreError, StoreResult};
pub use types::*;

/// tscell version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Engine - writer path, read path and compaction lifecycle

use crate::clock::{Clock, SystemClock};
use crate::codec::{
    annotation_qualifier, decode_cell, encode_qualifier, encode_row_key, RowKey, SeriesKey,
};
use crate::compaction::{CompactionStats, Compactor, StatsSnapshot};
use crate::config::EngineConfig;
use crate::queue::CompactionQueue;
use crate::scheduler::{
    cut_off, CompactionScheduler, ErrorPolicy, FlushReport, RowFlusher, RowOutcome,
    SchedulerHandle,
};
use crate::storage::Store;
use crate::{Annotation, BaseTime, DataPoint, PointTime, Result, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decoded content of one row
#[derive(Debug, Clone, PartialEq)]
pub struct RowData {
    pub row: RowKey,
    pub base_time: BaseTime,
    /// Distinct points in time order
    pub points: Vec<DataPoint>,
    pub annotations: Vec<Annotation>,
    /// Whether reading the row wrote its compacted form back
    pub compacted: bool,
}

/// Time-series engine over a wide-column store
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    queue: Arc<CompactionQueue>,
    stats: Arc<CompactionStats>,
    flusher: Arc<RowFlusher>,
    scheduler: Arc<CompactionScheduler>,
    handle: Mutex<Option<SchedulerHandle>>,
}

impl Engine {
    /// Open an engine on the system clock.
    ///
    /// Must be called from within a tokio runtime when compactions are enabled.
    pub fn open(config: EngineConfig, store: Arc<dyn Store>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Open an engine with an explicit clock
    pub fn with_clock(
        config: EngineConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let compaction = &config.compaction;
        let queue = Arc::new(CompactionQueue::new(config.id_widths.metric));
        let stats = Arc::new(CompactionStats::new());
        let flusher = Arc::new(RowFlusher::new(
            store.clone(),
            config.family.clone(),
            Compactor::new(compaction.duplicate_policy, stats.clone()),
            ErrorPolicy::new(queue.clone(), stats.clone(), compaction.error_log_every),
            queue.clone(),
            compaction.max_concurrent_flushes,
        ));
        let scheduler = Arc::new(CompactionScheduler::new(
            flusher.clone(),
            queue.clone(),
            stats.clone(),
            clock.clone(),
            compaction.clone(),
        ));

        let handle = if config.enable_compactions {
            Some(scheduler.clone().spawn())
        } else {
            info!("Compactions are disabled");
            None
        };

        Ok(Self {
            config,
            store,
            clock,
            queue,
            stats,
            flusher,
            scheduler,
            handle: Mutex::new(handle),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build a series key from numeric ids using the configured widths
    pub fn series(&self, metric: u64, tags: &[(u64, u64)]) -> Result<SeriesKey> {
        SeriesKey::from_ids(&self.config.id_widths, metric, tags)
    }

    /// Write one point and schedule its row for compaction.
    ///
    /// Timestamps wider than 32 bits are taken as milliseconds.
    pub async fn add_point(
        &self,
        series: &SeriesKey,
        timestamp: u64,
        value: impl Into<Value>,
    ) -> Result<RowKey> {
        let time = PointTime::from_raw(timestamp);
        let (row, base_time) = encode_row_key(series, time)?;
        let (qualifier, value) = encode_qualifier(time, base_time, value.into())?;

        self.store
            .put(&row, &self.config.family, qualifier.into(), value.into())
            .await?;
        self.schedule(&row)?;
        Ok(row)
    }

    /// Write one point given as text; a `.` makes it a float
    pub async fn add_point_str(
        &self,
        series: &SeriesKey,
        timestamp: u64,
        value: &str,
    ) -> Result<RowKey> {
        let value = Value::parse(value)?;
        self.add_point(series, timestamp, value).await
    }

    /// Store an annotation in the row covering its start time
    pub async fn add_annotation(&self, series: &SeriesKey, note: &Annotation) -> Result<RowKey> {
        let time = PointTime::from_raw(note.start_time);
        let (row, base_time) = encode_row_key(series, time)?;
        let qualifier = annotation_qualifier(time, base_time)?;

        let mut note = note.clone();
        if note.tsuid.is_empty() {
            note.tsuid = series.tsuid();
        }
        self.store
            .put(&row, &self.config.family, qualifier.into(), note.to_json()?.into())
            .await?;
        debug!(tsuid = %note.tsuid, start = note.start_time, "Stored annotation");
        Ok(row)
    }

    /// Read the row covering `timestamp`.
    ///
    /// Rows old enough are compacted on the way; younger rows are merged in
    /// memory only.
    pub async fn read_row(&self, series: &SeriesKey, timestamp: u64) -> Result<RowData> {
        let (row, base_time) = encode_row_key(series, PointTime::from_raw(timestamp))?;
        let cells = self.store.get(&row, &self.config.family).await?;

        let mut annotations = Vec::new();
        let compaction = self.flusher.compactor().compact(&cells, &mut annotations);

        let points = match &compaction.merged {
            Some(merged) => decode_cell(base_time, &merged.qualifier, &merged.value)?,
            None => {
                let mut points = Vec::new();
                for cell in cells.iter().filter(|c| !c.is_extension()) {
                    match decode_cell(base_time, &cell.qualifier, &cell.value) {
                        Ok(decoded) => points.extend(decoded),
                        Err(e) => warn!(
                            "Skipping undecodable cell in row {:02X?}: {}",
                            row.as_bytes(),
                            e
                        ),
                    }
                }
                points
            }
        };

        let mut compacted = false;
        if self.config.enable_compactions && compaction.needs_io() {
            let guard = cut_off(self.clock.now_secs(), self.config.compaction.guard_interval_secs);
            if base_time <= guard {
                compacted =
                    self.flusher.commit(&row, &compaction).await == RowOutcome::Compacted;
            }
        }

        Ok(RowData {
            row,
            base_time,
            points,
            annotations,
            compacted,
        })
    }

    /// Compact every queued row old enough, ignoring the per-cycle budget
    pub async fn flush(&self) -> FlushReport {
        let report = self.scheduler.flush_now().await;
        info!(
            "Flushed {} rows ({} compacted, {} re-queued)",
            report.rows, report.compacted, report.retried
        );
        report
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.queue.len())
    }

    /// Rows waiting for compaction
    pub fn pending_rows(&self) -> usize {
        self.queue.len()
    }

    /// Drain the compaction queue, then release the store
    pub async fn shutdown(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await?;
        }
        self.store.shutdown().await?;
        info!("Engine shut down, {} rows left uncompacted", self.queue.len());
        Ok(())
    }

    fn schedule(&self, row: &RowKey) -> Result<()> {
        if self.config.enable_compactions {
            self.queue.add(row)?;
        }
        Ok(())
    }
}

//! Row compaction
//!
//! Merges every datapoint cell of a row into one cell whose qualifier is the
//! concatenation of the point qualifiers in time order and whose value is the
//! concatenation of the point values. Previously compacted cells take part in
//! the merge like any other cell, so compacting a row twice is a no-op.

mod column;
mod stats;

pub use stats::{CompactionStats, StatsSnapshot, StoreOp};

use crate::codec::{
    decode_value, flags, in_milliseconds, value_len, ANNOTATION_PREFIX, MS_MIXED_COMPACT,
};
use crate::{Annotation, Cell};
use bytes::{BufMut, Bytes, BytesMut};
use column::{Column, Cursor};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Which point survives when two points share an instant but not a value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the point emitted first (the earliest column)
    #[default]
    KeepFirst,
    /// Keep the point emitted last
    KeepLast,
}

/// Outcome of compacting one row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Compaction {
    /// The merged cell, `None` if the row needs no compaction
    pub merged: Option<Cell>,
    /// Whether `merged` must be written back
    pub write: bool,
    /// Qualifiers of the cells superseded by `merged`
    pub deletes: Vec<Bytes>,
}

impl Compaction {
    /// Whether committing this compaction touches the store at all
    pub fn needs_io(&self) -> bool {
        self.merged.is_some() && (self.write || !self.deletes.is_empty())
    }
}

/// Merges the cells of a row
#[derive(Debug, Clone)]
pub struct Compactor {
    policy: DuplicatePolicy,
    stats: Arc<CompactionStats>,
}

impl Compactor {
    pub fn new(policy: DuplicatePolicy, stats: Arc<CompactionStats>) -> Self {
        Self { policy, stats }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    pub fn stats(&self) -> &Arc<CompactionStats> {
        &self.stats
    }

    /// Compact the cells of one row, appending its annotations to `annotations`
    pub fn compact(&self, cells: &[Cell], annotations: &mut Vec<Annotation>) -> Compaction {
        let mut datapoints = 0;
        let mut last = None;
        for (i, cell) in cells.iter().enumerate() {
            if cell.is_extension() {
                self.extract_annotation(cell, annotations);
            } else {
                datapoints += 1;
                last = Some(i);
            }
        }

        match (datapoints, last) {
            (0, _) | (_, None) => return Compaction::default(),
            (1, Some(i)) if is_canonical(&cells[i]) => return Compaction::default(),
            _ => {}
        }

        self.merge(cells.iter().filter(|c| !c.is_extension()))
    }

    fn extract_annotation(&self, cell: &Cell, out: &mut Vec<Annotation>) {
        if cell.qualifier[0] != ANNOTATION_PREFIX {
            warn!(
                "Ignoring unexpected extended format type {:#04x} in row {:02X?}",
                cell.qualifier[0],
                &cell.row[..]
            );
            return;
        }
        match Annotation::from_json(&cell.value) {
            Ok(note) => out.push(note),
            Err(e) => warn!("Skipping unreadable annotation in row {:02X?}: {}", &cell.row[..], e),
        }
    }

    fn merge<'a>(&self, cells: impl Iterator<Item = &'a Cell>) -> Compaction {
        self.stats.record_merge();

        let mut sources: Vec<&Cell> = Vec::new();
        let mut columns: Vec<Column> = Vec::new();
        for cell in cells {
            match Column::prepare(cell) {
                Ok(column) => {
                    sources.push(cell);
                    columns.push(column);
                }
                Err(e) => {
                    self.stats.record_malformed();
                    warn!(
                        "Leaving malformed cell {:02X?} in row {:02X?}: {}",
                        &cell.qualifier[..],
                        &cell.row[..],
                        e
                    );
                }
            }
        }
        if columns.is_empty() {
            return Compaction::default();
        }

        let total: usize = columns.iter().map(Column::points).sum();
        let mut heap = BinaryHeap::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            heap.push(Reverse(Cursor::first(i, column)));
        }

        let mut points: Vec<(&[u8], &[u8])> = Vec::with_capacity(total);
        let mut prev_offset = None;
        while let Some(Reverse(cursor)) = heap.pop() {
            let column = &columns[cursor.column()];
            let (qual, val) = cursor.point(column);

            if prev_offset == Some(cursor.offset_ms()) {
                if let Some(kept) = points.last_mut() {
                    let same = same_point_value(*kept, (qual, val));
                    self.stats.record_duplicate(same);
                    if same {
                        debug!(offset_ms = cursor.offset_ms(), "Dropping same-value duplicate");
                    } else {
                        warn!(
                            "Conflicting duplicate at offset {}ms in row {:02X?}, keeping {:?}",
                            cursor.offset_ms(),
                            &sources[0].row[..],
                            self.policy
                        );
                        if self.policy == DuplicatePolicy::KeepLast {
                            *kept = (qual, val);
                        }
                    }
                }
            } else {
                prev_offset = Some(cursor.offset_ms());
                points.push((qual, val));
            }

            if let Some(next) = cursor.advance(column) {
                heap.push(Reverse(next));
            }
        }

        if points.is_empty() {
            return Compaction::default();
        }
        let merged = build_cell(sources[0].row.clone(), &points);

        let mut deletes: Vec<Bytes> = sources.iter().map(|c| c.qualifier.clone()).collect();
        let mut write = true;
        if let Some(pos) = sources.iter().position(|c| c.qualifier == merged.qualifier) {
            // The merged cell already exists: never delete it, only overwrite on change.
            deletes.remove(pos);
            write = sources[pos].value != merged.value;
        }

        Compaction {
            merged: Some(merged),
            write,
            deletes,
        }
    }
}

/// A lone point in its native encoding, with nothing to merge or repair
fn is_canonical(cell: &Cell) -> bool {
    let q = &cell.qualifier;
    let single = match q.len() {
        2 => !in_milliseconds(q[0]),
        4 => in_milliseconds(q[0]),
        _ => false,
    };
    single && cell.value.len() == value_len(flags(q))
}

fn same_point_value(a: (&[u8], &[u8]), b: (&[u8], &[u8])) -> bool {
    if a.1 == b.1 && flags(a.0) == flags(b.0) {
        return true;
    }
    match (decode_value(flags(a.0), a.1), decode_value(flags(b.0), b.1)) {
        (Ok(x), Ok(y)) => x.same_value(&y),
        _ => false,
    }
}

fn build_cell(row: Bytes, points: &[(&[u8], &[u8])]) -> Cell {
    let qual_len: usize = points.iter().map(|(q, _)| q.len()).sum();
    let val_len: usize = points.iter().map(|(_, v)| v.len()).sum();
    let mut qualifier = BytesMut::with_capacity(qual_len);
    let mut value = BytesMut::with_capacity(val_len + 1);

    let mut ms = false;
    let mut secs = false;
    for (q, v) in points {
        if in_milliseconds(q[0]) {
            ms = true;
        } else {
            secs = true;
        }
        qualifier.put_slice(q);
        value.put_slice(v);
    }
    if points.len() > 1 {
        value.put_u8(if ms && secs { MS_MIXED_COMPACT } else { 0 });
    }

    Cell::new(row, qualifier.freeze(), value.freeze())
}

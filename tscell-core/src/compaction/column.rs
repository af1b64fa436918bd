//! Merge cursors over datapoint cells

use crate::codec::{
    fix_single_point, flags, offset_ms, packed_point_count, qualifier_width, value_len,
};
use crate::{Cell, Result};
use bytes::Bytes;

/// A datapoint cell ready to be merged, with legacy fix-ups applied
#[derive(Debug)]
pub(super) struct Column {
    qualifier: Bytes,
    value: Bytes,
    points: usize,
}

impl Column {
    /// Validate a datapoint cell and repair single-point encodings
    pub(super) fn prepare(cell: &Cell) -> Result<Self> {
        let q = &cell.qualifier;
        let single = !q.is_empty() && q.len() == qualifier_width(q[0]);
        if single {
            if let Some((qualifier, value)) = fix_single_point(q, &cell.value)? {
                return Ok(Self {
                    qualifier: qualifier.into(),
                    value: value.into(),
                    points: 1,
                });
            }
        }
        let points = packed_point_count(q, &cell.value)?;
        Ok(Self {
            qualifier: q.clone(),
            value: cell.value.clone(),
            points,
        })
    }

    pub(super) fn points(&self) -> usize {
        self.points
    }
}

/// Position of the next unmerged point of one column.
///
/// Ordered by offset, then column index, so equal instants pop in input order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) struct Cursor {
    offset_ms: u32,
    column: usize,
    q: usize,
    v: usize,
}

impl Cursor {
    pub(super) fn first(column: usize, col: &Column) -> Self {
        Self {
            offset_ms: offset_ms(&col.qualifier),
            column,
            q: 0,
            v: 0,
        }
    }

    pub(super) fn column(&self) -> usize {
        self.column
    }

    pub(super) fn offset_ms(&self) -> u32 {
        self.offset_ms
    }

    /// Qualifier and value bytes of the current point
    pub(super) fn point<'a>(&self, col: &'a Column) -> (&'a [u8], &'a [u8]) {
        let width = qualifier_width(col.qualifier[self.q]);
        let qual = &col.qualifier[self.q..self.q + width];
        let len = value_len(flags(qual));
        (qual, &col.value[self.v..self.v + len])
    }

    /// Move to the next point of the column, if any
    pub(super) fn advance(self, col: &Column) -> Option<Self> {
        let (qual, val) = self.point(col);
        let q = self.q + qual.len();
        if q >= col.qualifier.len() {
            return None;
        }
        Some(Self {
            offset_ms: offset_ms(&col.qualifier[q..]),
            column: self.column,
            q,
            v: self.v + val.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_walks_packed_column() {
        // Two second points (offsets 0 and 2) then one ms point (offset 2500)
        let mut qualifier = vec![0x00, 0x00, 0x00, 0x20];
        qualifier.extend_from_slice(&(0xF000_0000u32 | (2500 << 6)).to_be_bytes());
        let cell = Cell::new(vec![0u8; 7], qualifier, vec![1, 2, 3, 0x01]);

        let col = Column::prepare(&cell).unwrap();
        assert_eq!(col.points(), 3);

        let c = Cursor::first(0, &col);
        assert_eq!(c.offset_ms(), 0);
        assert_eq!(c.point(&col).1, &[1]);
        let c = c.advance(&col).unwrap();
        assert_eq!(c.offset_ms(), 2000);
        let c = c.advance(&col).unwrap();
        assert_eq!(c.offset_ms(), 2500);
        assert_eq!(c.point(&col), (&[0xF0, 0x02, 0x71, 0x00][..], &[3u8][..]));
        assert!(c.advance(&col).is_none());
    }

    #[test]
    fn test_prepare_rejects_truncated_cell() {
        let cell = Cell::new(vec![0u8; 7], vec![0x00, 0x07, 0x00], vec![0u8; 8]);
        assert!(Column::prepare(&cell).is_err());
    }
}

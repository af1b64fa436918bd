//! Row key and column qualifier encoding
//!
//! Every data point is written as one narrow cell:
//!
//! - **Row key**: `metric ‖ base_time ‖ (tag name, tag value)*`, where the
//!   base time is the point's second timestamp rounded down to
//!   [`MAX_TIMESPAN`] and stored as a big-endian `u32`.
//! - **Qualifier**: the point's offset from the base time plus 4 flag bits
//!   (`float` bit and `length - 1`). Second offsets use 2 bytes, millisecond
//!   offsets use 4 bytes with the high nibble set to `0xF`.
//! - **Value**: big-endian integer (1, 2, 4 or 8 bytes) or IEEE float (4 or
//!   8 bytes).
//!
//! Compacted cells concatenate those qualifiers and values in time order and
//! append one metadata byte. All functions here are pure.

mod qualifier;
mod row;

pub use qualifier::{
    annotation_offset_ms, annotation_qualifier, decode_cell, decode_point, decode_value,
    encode_qualifier, encode_value, fix_single_point, flags, in_milliseconds, offset_ms,
    packed_point_count, qualifier_width, valid_flags, value_len, with_flags, PackedPoints,
};
pub use row::{base_time_of, encode_row_key, validate_time, IdWidths, RowKey, SeriesKey};

/// Span of time covered by one row, in seconds
pub const MAX_TIMESPAN: u32 = 3600;

/// Width of the base time embedded in row keys
pub const TIMESTAMP_BYTES: usize = 4;

/// Number of flag bits in a second-resolution qualifier
pub const FLAG_BITS: u32 = 4;

/// Number of low bits below the offset in a millisecond qualifier
pub const MS_FLAG_BITS: u32 = 6;

/// Flag bit set for floating point values
pub const FLAG_FLOAT: u8 = 0x08;

/// Mask of the `length - 1` bits
pub const LENGTH_MASK: u8 = 0x07;

/// Mask of all value flags
pub const FLAGS_MASK: u8 = FLAG_FLOAT | LENGTH_MASK;

/// High nibble marking a 4-byte millisecond qualifier
pub const MS_BYTE_FLAG: u8 = 0xF0;

/// Millisecond qualifier marker bits as a `u32`
pub const MS_FLAG: u32 = 0xF000_0000;

/// Metadata bit: the compacted cell mixes second and millisecond points
pub const MS_MIXED_COMPACT: u8 = 0x01;

/// First byte of an annotation qualifier
pub const ANNOTATION_PREFIX: u8 = 0x01;

/// Largest millisecond timestamp accepted (13 digits)
pub const MAX_MS_TIMESTAMP: u64 = 9_999_999_999_999;

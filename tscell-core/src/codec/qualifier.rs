//! Column qualifier and value encoding

use super::{
    validate_time, ANNOTATION_PREFIX, FLAGS_MASK, FLAG_BITS, FLAG_FLOAT, LENGTH_MASK,
    MAX_TIMESPAN, MS_BYTE_FLAG, MS_FLAG, MS_FLAG_BITS,
};
use crate::{BaseTime, DataPoint, Error, PointTime, Resolution, Result, Value};

/// Check whether a qualifier starting with this byte is in milliseconds
#[inline]
pub fn in_milliseconds(first_byte: u8) -> bool {
    first_byte & MS_BYTE_FLAG == MS_BYTE_FLAG
}

/// Width of the point qualifier starting with this byte
#[inline]
pub fn qualifier_width(first_byte: u8) -> usize {
    if in_milliseconds(first_byte) {
        4
    } else {
        2
    }
}

/// Offset from the base time in milliseconds.
///
/// `qualifier` must start with one complete point qualifier.
#[inline]
pub fn offset_ms(qualifier: &[u8]) -> u32 {
    if in_milliseconds(qualifier[0]) {
        let raw = u32::from_be_bytes([qualifier[0], qualifier[1], qualifier[2], qualifier[3]]);
        (raw & !MS_FLAG) >> MS_FLAG_BITS
    } else {
        let raw = u16::from_be_bytes([qualifier[0], qualifier[1]]);
        (raw >> FLAG_BITS) as u32 * 1000
    }
}

/// Value flags of the point qualifier at the start of `qualifier`
#[inline]
pub fn flags(qualifier: &[u8]) -> u8 {
    qualifier[qualifier_width(qualifier[0]) - 1] & FLAGS_MASK
}

/// Value length encoded in the flags
#[inline]
pub fn value_len(flags: u8) -> usize {
    (flags & LENGTH_MASK) as usize + 1
}

/// Whether the flags describe a storable value (1/2/4/8-byte integer, 4/8-byte float)
#[inline]
pub fn valid_flags(flags: u8) -> bool {
    if flags & FLAG_FLOAT != 0 {
        matches!(value_len(flags), 4 | 8)
    } else {
        matches!(value_len(flags), 1 | 2 | 4 | 8)
    }
}

/// Copy a single point qualifier with its flags replaced
pub fn with_flags(qualifier: &[u8], flags: u8) -> Vec<u8> {
    let mut fixed = qualifier.to_vec();
    if let Some(last) = fixed.last_mut() {
        *last = (*last & !FLAGS_MASK) | (flags & FLAGS_MASK);
    }
    fixed
}

/// Encode a value, returning its flags and bytes
pub fn encode_value(value: Value) -> Result<(u8, Vec<u8>)> {
    match value {
        Value::Integer(v) => {
            let bytes = if let Ok(b) = i8::try_from(v) {
                b.to_be_bytes().to_vec()
            } else if let Ok(s) = i16::try_from(v) {
                s.to_be_bytes().to_vec()
            } else if let Ok(i) = i32::try_from(v) {
                i.to_be_bytes().to_vec()
            } else {
                v.to_be_bytes().to_vec()
            };
            Ok(((bytes.len() - 1) as u8, bytes))
        }
        Value::Float(v) => {
            if !v.is_finite() {
                return Err(Error::InvalidValue(format!("value is NaN or infinite: {}", v)));
            }
            let narrow = v as f32;
            if narrow as f64 == v {
                Ok((FLAG_FLOAT | 0x3, narrow.to_bits().to_be_bytes().to_vec()))
            } else {
                Ok((FLAG_FLOAT | 0x7, v.to_bits().to_be_bytes().to_vec()))
            }
        }
    }
}

/// Decode value bytes according to their flags
pub fn decode_value(flags: u8, bytes: &[u8]) -> Result<Value> {
    let expected = value_len(flags);
    if bytes.len() != expected {
        return Err(Error::InvalidQualifier(format!(
            "value is {} bytes, flags say {}",
            bytes.len(),
            expected
        )));
    }
    if flags & FLAG_FLOAT != 0 {
        match bytes.len() {
            4 => {
                let bits = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Ok(Value::Float(f32::from_bits(bits) as f64))
            }
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(Value::Float(f64::from_bits(u64::from_be_bytes(raw))))
            }
            n => Err(Error::InvalidQualifier(format!("{}-byte float", n))),
        }
    } else {
        match bytes.len() {
            1 => Ok(Value::Integer(bytes[0] as i8 as i64)),
            2 => Ok(Value::Integer(i16::from_be_bytes([bytes[0], bytes[1]]) as i64)),
            4 => Ok(Value::Integer(
                i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
            )),
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(Value::Integer(i64::from_be_bytes(raw)))
            }
            n => Err(Error::InvalidQualifier(format!("{}-byte integer", n))),
        }
    }
}

/// Encode the qualifier and value of one point in the row at `base_time`
pub fn encode_qualifier(
    time: PointTime,
    base_time: BaseTime,
    value: Value,
) -> Result<(Vec<u8>, Vec<u8>)> {
    validate_time(time)?;
    let (flags, bytes) = encode_value(value)?;
    let qualifier = match time {
        PointTime::Seconds(secs) => {
            let offset = secs
                .checked_sub(base_time as u64)
                .filter(|o| *o < MAX_TIMESPAN as u64)
                .ok_or_else(|| out_of_row(secs, base_time))?;
            (((offset as u16) << FLAG_BITS) | flags as u16).to_be_bytes().to_vec()
        }
        PointTime::Millis(ms) => {
            let offset = ms
                .checked_sub(base_time as u64 * 1000)
                .filter(|o| *o < MAX_TIMESPAN as u64 * 1000)
                .ok_or_else(|| out_of_row(ms, base_time))?;
            (MS_FLAG | ((offset as u32) << MS_FLAG_BITS) | flags as u32)
                .to_be_bytes()
                .to_vec()
        }
    };
    Ok((qualifier, bytes))
}

fn out_of_row(timestamp: u64, base_time: BaseTime) -> Error {
    Error::InvalidTimestamp(format!(
        "timestamp {} is outside the row starting at {}",
        timestamp, base_time
    ))
}

/// Walks the points of a single-point or compacted cell
#[derive(Debug, Clone)]
pub struct PackedPoints<'a> {
    qualifier: &'a [u8],
    value: &'a [u8],
    q: usize,
    v: usize,
}

impl<'a> PackedPoints<'a> {
    pub fn new(qualifier: &'a [u8], value: &'a [u8]) -> Self {
        Self {
            qualifier,
            value,
            q: 0,
            v: 0,
        }
    }

    /// Value bytes not consumed by any point so far
    pub fn remaining_value(&self) -> usize {
        self.value.len() - self.v
    }

    fn truncated(&mut self, what: &str) -> Error {
        self.q = self.qualifier.len();
        Error::InvalidQualifier(format!("truncated {}", what))
    }
}

impl<'a> Iterator for PackedPoints<'a> {
    type Item = Result<(&'a [u8], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.q >= self.qualifier.len() {
            return None;
        }
        let width = qualifier_width(self.qualifier[self.q]);
        if self.q + width > self.qualifier.len() {
            return Some(Err(self.truncated("qualifier")));
        }
        let qual = &self.qualifier[self.q..self.q + width];
        let flags = flags(qual);
        if !valid_flags(flags) {
            self.q = self.qualifier.len();
            return Some(Err(Error::InvalidQualifier(format!(
                "invalid value flags {:#x}",
                flags
            ))));
        }
        let len = value_len(flags);
        if self.v + len > self.value.len() {
            return Some(Err(self.truncated("value")));
        }
        let val = &self.value[self.v..self.v + len];
        self.q += width;
        self.v += len;
        Some(Ok((qual, val)))
    }
}

/// Count the points of a datapoint cell, checking it is well formed.
///
/// Multi-point cells may carry one trailing metadata byte.
pub fn packed_point_count(qualifier: &[u8], value: &[u8]) -> Result<usize> {
    if qualifier.is_empty() || qualifier.len() % 2 == 1 {
        return Err(Error::InvalidQualifier(format!(
            "{}-byte qualifier is not a data point",
            qualifier.len()
        )));
    }
    let mut points = PackedPoints::new(qualifier, value);
    let mut count = 0;
    for point in points.by_ref() {
        point?;
        count += 1;
    }
    let trailing = points.remaining_value();
    if trailing > 1 || (count == 1 && trailing != 0) {
        return Err(Error::InvalidQualifier(format!(
            "{} unexpected trailing value bytes",
            trailing
        )));
    }
    Ok(count)
}

/// Decode a cell holding exactly one point
pub fn decode_point(base_time: BaseTime, qualifier: &[u8], value: &[u8]) -> Result<DataPoint> {
    if qualifier.is_empty() || qualifier.len() != qualifier_width(qualifier[0]) {
        return Err(Error::InvalidQualifier(format!(
            "{}-byte qualifier is not a single point",
            qualifier.len()
        )));
    }
    let flags = flags(qualifier);
    Ok(DataPoint {
        timestamp_ms: base_time as u64 * 1000 + offset_ms(qualifier) as u64,
        value: decode_value(flags, value)?,
        resolution: if in_milliseconds(qualifier[0]) {
            Resolution::Milliseconds
        } else {
            Resolution::Seconds
        },
    })
}

/// Decode every point of a single-point or compacted cell
pub fn decode_cell(base_time: BaseTime, qualifier: &[u8], value: &[u8]) -> Result<Vec<DataPoint>> {
    let count = packed_point_count(qualifier, value)?;
    let mut out = Vec::with_capacity(count);
    for point in PackedPoints::new(qualifier, value) {
        let (q, v) = point?;
        out.push(decode_point(base_time, q, v)?);
    }
    Ok(out)
}

/// Repair legacy single-point cells whose flags disagree with the value.
///
/// Returns `None` when the cell is already canonical.
pub fn fix_single_point(qualifier: &[u8], value: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let flags = flags(qualifier);
    let want = value_len(flags);
    let have = value.len();
    if have == want {
        return Ok(None);
    }

    let float = flags & FLAG_FLOAT != 0;
    if float && want == 4 && have == 8 && value[..4] == [0, 0, 0, 0] {
        // Old writers padded 4-byte floats to 8 bytes.
        return Ok(Some((qualifier.to_vec(), value[4..].to_vec())));
    }
    let valid = if float {
        matches!(have, 4 | 8)
    } else {
        matches!(have, 1 | 2 | 4 | 8)
    };
    if !valid {
        return Err(Error::InvalidQualifier(format!(
            "{}-byte value cannot be repaired (flags {:#x})",
            have, flags
        )));
    }
    let fixed = (flags & FLAG_FLOAT) | (have - 1) as u8;
    Ok(Some((with_flags(qualifier, fixed), value.to_vec())))
}

/// Qualifier of an annotation stored in the row at `base_time`
pub fn annotation_qualifier(time: PointTime, base_time: BaseTime) -> Result<Vec<u8>> {
    validate_time(time)?;
    let mut qualifier = vec![ANNOTATION_PREFIX];
    match time {
        PointTime::Seconds(secs) => {
            let offset = secs
                .checked_sub(base_time as u64)
                .filter(|o| *o < MAX_TIMESPAN as u64)
                .ok_or_else(|| out_of_row(secs, base_time))?;
            qualifier.extend_from_slice(&(offset as u16).to_be_bytes());
        }
        PointTime::Millis(ms) => {
            let offset = ms
                .checked_sub(base_time as u64 * 1000)
                .filter(|o| *o < MAX_TIMESPAN as u64 * 1000)
                .ok_or_else(|| out_of_row(ms, base_time))?;
            qualifier.extend_from_slice(&(offset as u32).to_be_bytes());
        }
    }
    Ok(qualifier)
}

/// Offset in milliseconds of an annotation qualifier, `None` for other extensions
pub fn annotation_offset_ms(qualifier: &[u8]) -> Option<u32> {
    match qualifier {
        [ANNOTATION_PREFIX, a, b] => Some(u16::from_be_bytes([*a, *b]) as u32 * 1000),
        [ANNOTATION_PREFIX, a, b, c, d] => Some(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}

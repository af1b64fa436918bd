//! Core types for tscell

use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unix timestamp in seconds (row base times are 32-bit)
pub type BaseTime = u32;

/// Any timestamp with one of these bits set is in milliseconds
const SECOND_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// Resolution a point was written at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    Seconds,
    Milliseconds,
}

/// Timestamp of a single data point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointTime {
    /// Unix seconds, encoded with a 2-byte qualifier
    Seconds(u64),
    /// Unix milliseconds, encoded with a 4-byte qualifier
    Millis(u64),
}

impl PointTime {
    /// Interpret a raw epoch value: anything wider than 32 bits is milliseconds
    pub fn from_raw(timestamp: u64) -> Self {
        if timestamp & SECOND_MASK != 0 {
            PointTime::Millis(timestamp)
        } else {
            PointTime::Seconds(timestamp)
        }
    }

    /// Epoch seconds (milliseconds are truncated)
    pub fn epoch_secs(&self) -> u64 {
        match *self {
            PointTime::Seconds(s) => s,
            PointTime::Millis(ms) => ms / 1000,
        }
    }

    /// Epoch milliseconds
    pub fn epoch_millis(&self) -> u64 {
        match *self {
            PointTime::Seconds(s) => s.saturating_mul(1000),
            PointTime::Millis(ms) => ms,
        }
    }

    pub fn resolution(&self) -> Resolution {
        match self {
            PointTime::Seconds(_) => Resolution::Seconds,
            PointTime::Millis(_) => Resolution::Milliseconds,
        }
    }
}

/// Numeric value of a data point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit float (stored on 4 bytes when lossless)
    Float(f64),
}

impl Value {
    /// Parse a textual value; a `.` anywhere makes it a float
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.contains('.') {
            let v: f64 = s
                .parse()
                .map_err(|e| Error::InvalidValue(format!("{:?}: {}", s, e)))?;
            Ok(Value::Float(v))
        } else {
            let v: i64 = s
                .parse()
                .map_err(|e| Error::InvalidValue(format!("{:?}: {}", s, e)))?;
            Ok(Value::Integer(v))
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Value::Float(_))
    }

    /// Get as f64
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Integer(v) => v as f64,
            Value::Float(v) => v,
        }
    }

    /// Numeric equality across encodings: `5` and `5.0` are the same value
    pub fn same_value(&self, other: &Value) -> bool {
        match (*self, *other) {
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(i), Value::Float(f)) | (Value::Float(f), Value::Integer(i)) => {
                f.fract() == 0.0 && f == i as f64 && f as i64 == i
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

/// A decoded data point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Absolute timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Decoded value
    pub value: Value,
    /// Qualifier form the point was stored with
    pub resolution: Resolution,
}

/// One cell of a wide-column row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Row key
    pub row: Bytes,
    /// Column qualifier
    pub qualifier: Bytes,
    /// Cell value
    pub value: Bytes,
    /// Store-side write time (monotonic per store)
    pub write_time: u64,
}

impl Cell {
    /// Create a cell that has not been written yet
    pub fn new(
        row: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            row: row.into(),
            qualifier: qualifier.into(),
            value: value.into(),
            write_time: 0,
        }
    }

    /// Odd-length qualifiers carry extensions, never data points
    pub fn is_extension(&self) -> bool {
        self.qualifier.len() % 2 == 1
    }
}

/// A note attached to a row, stored as JSON in an odd-length column
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Annotation {
    /// Hex series id the note belongs to (empty for global notes)
    pub tsuid: String,
    /// Start of the annotated event, Unix seconds
    pub start_time: u64,
    /// End of the annotated event, Unix seconds (0 if open)
    pub end_time: u64,
    /// Short description
    pub description: String,
    /// Free-form notes
    pub notes: String,
    /// User supplied key/value pairs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<BTreeMap<String, String>>,
}

impl Annotation {
    /// Create an annotation starting at the given time
    pub fn new(start_time: u64, description: impl Into<String>) -> Self {
        Self {
            start_time,
            description: description.into(),
            ..Default::default()
        }
    }

    /// Serialize to the JSON stored in the cell value
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the JSON stored in a cell value
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_time_from_raw() {
        assert_eq!(PointTime::from_raw(1_356_998_400), PointTime::Seconds(1_356_998_400));
        assert_eq!(
            PointTime::from_raw(1_356_998_400_500),
            PointTime::Millis(1_356_998_400_500)
        );
        assert_eq!(PointTime::Millis(1_356_998_400_500).epoch_secs(), 1_356_998_400);
        assert_eq!(PointTime::Seconds(10).epoch_millis(), 10_000);
    }

    #[test]
    fn test_value_parse() {
        assert_eq!(Value::parse("42").unwrap(), Value::Integer(42));
        assert_eq!(Value::parse("-7").unwrap(), Value::Integer(-7));
        assert_eq!(Value::parse("4.5").unwrap(), Value::Float(4.5));
        assert!(Value::parse("abc").is_err());
        assert!(Value::parse("1.2.3").is_err());
    }

    #[test]
    fn test_value_same_value() {
        assert!(Value::Integer(5).same_value(&Value::Float(5.0)));
        assert!(Value::Float(5.0).same_value(&Value::Integer(5)));
        assert!(!Value::Integer(5).same_value(&Value::Float(5.5)));
        assert!(!Value::Integer(5).same_value(&Value::Integer(6)));
    }

    #[test]
    fn test_annotation_json() {
        let mut note = Annotation::new(1_356_998_400, "deploy");
        note.tsuid = "000001000001000001".into();
        let json = note.to_json().unwrap();
        let text = String::from_utf8(json.clone()).unwrap();
        assert!(text.contains("\"startTime\":1356998400"));

        let parsed = Annotation::from_json(&json).unwrap();
        assert_eq!(parsed, note);

        let partial = Annotation::from_json(br#"{"description":"x"}"#).unwrap();
        assert_eq!(partial.description, "x");
        assert_eq!(partial.start_time, 0);
    }
}

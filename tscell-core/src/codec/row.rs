//! Series keys and row keys

use super::{MAX_MS_TIMESTAMP, MAX_TIMESPAN, TIMESTAMP_BYTES};
use crate::{BaseTime, Error, PointTime, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed widths of the numeric identifiers making up a series key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdWidths {
    /// Metric id width in bytes
    pub metric: usize,
    /// Tag name id width in bytes
    pub tag_name: usize,
    /// Tag value id width in bytes
    pub tag_value: usize,
}

impl Default for IdWidths {
    fn default() -> Self {
        Self {
            metric: 3,
            tag_name: 3,
            tag_value: 3,
        }
    }
}

impl IdWidths {
    /// Check every width is between 1 and 8 bytes
    pub fn validate(&self) -> Result<()> {
        for (name, width) in [
            ("metric", self.metric),
            ("tag_name", self.tag_name),
            ("tag_value", self.tag_value),
        ] {
            if !(1..=8).contains(&width) {
                return Err(Error::Config(format!(
                    "{} id width must be between 1 and 8 bytes, got {}",
                    name, width
                )));
            }
        }
        Ok(())
    }

    /// Width of one (tag name, tag value) pair
    pub fn tag_pair(&self) -> usize {
        self.tag_name + self.tag_value
    }
}

/// Identifies one time series: a metric id plus canonically ordered tag ids
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    metric: Bytes,
    tags: Vec<(Bytes, Bytes)>,
}

impl SeriesKey {
    /// Create a series key from raw ids; tags are sorted by tag name id
    pub fn new<I, K, V>(widths: &IdWidths, metric: &[u8], tags: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        if metric.len() != widths.metric {
            return Err(Error::InvalidSeriesKey(format!(
                "metric id is {} bytes, expected {}",
                metric.len(),
                widths.metric
            )));
        }

        let mut pairs = Vec::new();
        for (name, value) in tags {
            let (name, value) = (name.as_ref(), value.as_ref());
            if name.len() != widths.tag_name || value.len() != widths.tag_value {
                return Err(Error::InvalidSeriesKey(format!(
                    "tag pair is {}+{} bytes, expected {}+{}",
                    name.len(),
                    value.len(),
                    widths.tag_name,
                    widths.tag_value
                )));
            }
            pairs.push((Bytes::copy_from_slice(name), Bytes::copy_from_slice(value)));
        }

        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        if pairs.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(Error::InvalidSeriesKey("duplicate tag name id".into()));
        }

        Ok(Self {
            metric: Bytes::copy_from_slice(metric),
            tags: pairs,
        })
    }

    /// Create a series key from numeric ids encoded big-endian at the configured widths
    pub fn from_ids(widths: &IdWidths, metric: u64, tags: &[(u64, u64)]) -> Result<Self> {
        let metric = encode_id(metric, widths.metric)?;
        let tags = tags
            .iter()
            .map(|&(k, v)| Ok((encode_id(k, widths.tag_name)?, encode_id(v, widths.tag_value)?)))
            .collect::<Result<Vec<_>>>()?;
        Self::new(widths, &metric, tags)
    }

    /// Metric id bytes
    pub fn metric(&self) -> &[u8] {
        &self.metric
    }

    /// Tag pairs in canonical order
    pub fn tags(&self) -> &[(Bytes, Bytes)] {
        &self.tags
    }

    /// Series id without base time (`metric ‖ tags`)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.metric);
        for (k, v) in &self.tags {
            buf.extend_from_slice(k);
            buf.extend_from_slice(v);
        }
        buf
    }

    /// Hex form of the series id, as stored in annotations
    pub fn tsuid(&self) -> String {
        self.to_bytes().iter().map(|b| format!("{:02X}", b)).collect()
    }

    fn encoded_len(&self) -> usize {
        self.metric.len() + self.tags.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tsuid())
    }
}

fn encode_id(id: u64, width: usize) -> Result<Vec<u8>> {
    if width < 8 && id >> (width * 8) != 0 {
        return Err(Error::InvalidSeriesKey(format!(
            "id {} does not fit in {} bytes",
            id, width
        )));
    }
    Ok(id.to_be_bytes()[8 - width..].to_vec())
}

/// Row key bytes: `metric ‖ base_time ‖ tags`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey(Bytes);

impl RowKey {
    /// Build the row key of a series for the given base time
    pub fn new(series: &SeriesKey, base_time: BaseTime) -> Self {
        let mut buf = BytesMut::with_capacity(series.encoded_len() + TIMESTAMP_BYTES);
        buf.put_slice(&series.metric);
        buf.put_u32(base_time);
        for (k, v) in &series.tags {
            buf.put_slice(k);
            buf.put_slice(v);
        }
        RowKey(buf.freeze())
    }

    /// Wrap raw bytes read back from the store
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        RowKey(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Cheap clone of the underlying buffer
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Base time stored right after the metric id
    pub fn base_time(&self, metric_width: usize) -> Result<BaseTime> {
        let end = metric_width + TIMESTAMP_BYTES;
        if self.0.len() < end {
            return Err(Error::InvalidRowKey {
                expected: end,
                actual: self.0.len(),
            });
        }
        let mut raw = [0u8; TIMESTAMP_BYTES];
        raw.copy_from_slice(&self.0[metric_width..end]);
        Ok(u32::from_be_bytes(raw))
    }

    /// Recover the series key
    pub fn series(&self, widths: &IdWidths) -> Result<SeriesKey> {
        let header = widths.metric + TIMESTAMP_BYTES;
        let pair = widths.tag_pair();
        if self.0.len() < header || (self.0.len() - header) % pair != 0 {
            return Err(Error::InvalidRowKey {
                expected: header,
                actual: self.0.len(),
            });
        }
        let tags = self.0[header..]
            .chunks_exact(pair)
            .map(|c| (&c[..widths.tag_name], &c[widths.tag_name..]));
        SeriesKey::new(widths, &self.0[..widths.metric], tags)
    }
}

impl AsRef<[u8]> for RowKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Round a second timestamp down to its row boundary
pub fn base_time_of(epoch_secs: u64) -> BaseTime {
    (epoch_secs - epoch_secs % MAX_TIMESPAN as u64) as BaseTime
}

/// Reject timestamps that cannot be stored
pub fn validate_time(time: PointTime) -> Result<()> {
    match time {
        PointTime::Seconds(s) if s > u32::MAX as u64 => Err(Error::InvalidTimestamp(format!(
            "second timestamp {} does not fit in 32 bits",
            s
        ))),
        PointTime::Millis(ms) if ms > MAX_MS_TIMESTAMP => Err(Error::InvalidTimestamp(format!(
            "millisecond timestamp {} exceeds {}",
            ms, MAX_MS_TIMESTAMP
        ))),
        PointTime::Millis(ms) if ms / 1000 > u32::MAX as u64 => Err(Error::InvalidTimestamp(
            format!("millisecond timestamp {} does not fit a 32-bit base time", ms),
        )),
        _ => Ok(()),
    }
}

/// Compute the row key and base time a point is written to
pub fn encode_row_key(series: &SeriesKey, time: PointTime) -> Result<(RowKey, BaseTime)> {
    validate_time(time)?;
    let base_time = base_time_of(time.epoch_secs());
    Ok((RowKey::new(series, base_time), base_time))
}

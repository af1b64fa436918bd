//! Engine configuration
//!
//! Every setting has a default below; a JSON file only needs to name the
//! settings it changes.

use crate::codec::IdWidths;
use crate::compaction::DuplicatePolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Column family data points are stored in
pub const DEFAULT_FAMILY: &str = "t";

/// Seconds between two scheduler cycles
pub const FLUSH_INTERVAL_SECS: u64 = 10;

/// Pending rows below which a cycle does nothing; also the minimum budget
pub const MIN_FLUSH_THRESHOLD: usize = 100;

/// Rows compacted concurrently within one batch
pub const MAX_CONCURRENT_FLUSHES: usize = 10_000;

/// How many times faster than rows arrive the backlog is drained
pub const FLUSH_SPEED: u64 = 2;

/// Extra age, beyond one row span, before a row may be compacted
pub const GUARD_INTERVAL_SECS: u64 = 1;

/// Pending rows above which the whole queue is dropped
pub const MAX_PENDING_ROWS: usize = 10_000_000;

/// Delay before restarting a crashed scheduler loop
pub const RESTART_DELAY_MS: u64 = 1_000;

/// Passes over the queue made when shutting down
pub const DRAIN_ROUNDS: usize = 3;

/// Store failures of one kind logged once per this many occurrences
pub const ERROR_LOG_EVERY: u64 = 100;

/// Background compaction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub flush_interval_secs: u64,
    pub min_flush_threshold: usize,
    pub max_concurrent_flushes: usize,
    pub flush_speed: u64,
    pub guard_interval_secs: u64,
    pub max_pending_rows: usize,
    pub duplicate_policy: DuplicatePolicy,
    pub restart_delay_ms: u64,
    pub drain_rounds: usize,
    pub error_log_every: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: FLUSH_INTERVAL_SECS,
            min_flush_threshold: MIN_FLUSH_THRESHOLD,
            max_concurrent_flushes: MAX_CONCURRENT_FLUSHES,
            flush_speed: FLUSH_SPEED,
            guard_interval_secs: GUARD_INTERVAL_SECS,
            max_pending_rows: MAX_PENDING_ROWS,
            duplicate_policy: DuplicatePolicy::default(),
            restart_delay_ms: RESTART_DELAY_MS,
            drain_rounds: DRAIN_ROUNDS,
            error_log_every: ERROR_LOG_EVERY,
        }
    }
}

impl CompactionConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("flush_interval_secs", self.flush_interval_secs),
            ("max_concurrent_flushes", self.max_concurrent_flushes as u64),
            ("flush_speed", self.flush_speed),
            ("error_log_every", self.error_log_every),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }
        if self.max_pending_rows < self.min_flush_threshold {
            return Err(Error::Config(format!(
                "max_pending_rows ({}) is below min_flush_threshold ({})",
                self.max_pending_rows, self.min_flush_threshold
            )));
        }
        Ok(())
    }
}

/// Top-level engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// When off, rows are never scheduled and merges are never written back
    pub enable_compactions: bool,
    /// Column family holding data points and annotations
    pub family: String,
    /// Identifier widths used to build and parse row keys
    pub id_widths: IdWidths,
    pub compaction: CompactionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_compactions: true,
            family: DEFAULT_FAMILY.to_string(),
            id_widths: IdWidths::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document
    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.family.is_empty() {
            return Err(Error::Config("family must not be empty".into()));
        }
        self.id_widths.validate()?;
        self.compaction.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.enable_compactions);
        assert_eq!(config.family, "t");
        assert_eq!(config.compaction.flush_interval(), Duration::from_secs(10));
        assert_eq!(config.compaction.duplicate_policy, DuplicatePolicy::KeepFirst);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json() {
        let config = EngineConfig::from_json(
            r#"{"compaction": {"flush_speed": 4, "duplicate_policy": "keep_last"}}"#,
        )
        .unwrap();
        assert_eq!(config.compaction.flush_speed, 4);
        assert_eq!(config.compaction.duplicate_policy, DuplicatePolicy::KeepLast);
        assert_eq!(config.compaction.min_flush_threshold, MIN_FLUSH_THRESHOLD);
        assert_eq!(config.id_widths, IdWidths::default());
    }

    #[test]
    fn test_invalid_config() {
        assert!(EngineConfig::from_json(r#"{"family": ""}"#).is_err());
        assert!(EngineConfig::from_json(r#"{"id_widths": {"metric": 0}}"#).is_err());
        assert!(EngineConfig::from_json(r#"{"compaction": {"flush_interval_secs": 0}}"#).is_err());
        assert!(matches!(EngineConfig::from_json("{"), Err(Error::Json(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"enable_compactions": false}}"#).unwrap();
        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert!(!config.enable_compactions);

        assert!(matches!(
            EngineConfig::from_json_file("/nonexistent/tscell.json"),
            Err(Error::Io(_))
        ));
    }
}

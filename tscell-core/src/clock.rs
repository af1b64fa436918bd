//! Wall clock abstraction

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of the current time in Unix seconds
pub trait Clock: Send + Sync + 'static {
    fn now_secs(&self) -> u64;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        Utc::now().timestamp().max(0) as u64
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_secs: u64) -> Self {
        Self {
            now: AtomicU64::new(now_secs),
        }
    }

    pub fn set(&self, now_secs: u64) {
        self.now.store(now_secs, Ordering::Release);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

//! Wall clocks used to pace media against real time

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use super::types::MediaTime;

/// Source of the current wall-clock position
///
/// Only differences between two readings are meaningful.
pub trait Clock: Send + Sync {
    fn now(&self) -> MediaTime;
}

/// Monotonic clock measured from its creation
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    base: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MediaTime {
        MediaTime::from_duration(self.base.elapsed())
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.ticks
            .fetch_add(MediaTime::from_duration(by).ticks(), Ordering::AcqRel);
    }

    pub fn set(&self, time: MediaTime) {
        self.ticks.store(time.ticks(), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MediaTime {
        MediaTime::from_ticks(self.ticks.load(Ordering::Acquire))
    }
}

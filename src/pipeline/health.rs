//! Per-stage counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Health metrics for one stage
///
/// All fields use atomic operations so the stage worker and observers can
/// touch them concurrently.
pub struct StageMetrics {
    created: Instant,

    /// Items handed downstream and accepted by at least one listener
    pub posted: AtomicU64,

    /// Posts no listener accepted (retried later, never dropped)
    pub rejected: AtomicU64,

    /// Items discarded by the stage
    pub dropped: AtomicU64,

    /// Compressed units the decoder failed on
    pub decode_failures: AtomicU64,

    /// Codec or sink teardown-and-reinitialize cycles
    pub device_resets: AtomicU64,

    /// Microseconds since `created` of the last recorded activity
    last_activity: AtomicU64,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
            posted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            device_resets: AtomicU64::new(0),
            last_activity: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let micros = self.created.elapsed().as_micros() as u64;
        self.last_activity.store(micros, Ordering::Relaxed);
    }

    pub fn record_posted(&self) {
        self.posted.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_reset(&self) {
        self.device_resets.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    pub fn device_resets(&self) -> u64 {
        self.device_resets.load(Ordering::Relaxed)
    }

    /// Check if the stage has stalled (no activity for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last = Duration::from_micros(self.last_activity.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last) > threshold
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            posted: self.posted(),
            rejected: self.rejected(),
            dropped: self.dropped(),
            decode_failures: self.decode_failures(),
            device_resets: self.device_resets(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of stage metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSummary {
    pub posted: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub decode_failures: u64,
    pub device_resets: u64,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} posted ({} rejected, {} dropped), {} decode failures, {} device resets",
            self.posted, self.rejected, self.dropped, self.decode_failures, self.device_resets
        )
    }
}

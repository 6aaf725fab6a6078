//! Core types for the pipeline system

use anyhow::{Result, ensure};
use bytes::Bytes;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Ticks of [`MediaTime`] in one second (100 ns resolution).
pub const TICKS_PER_SECOND: i64 = 10_000_000;
const TICKS_PER_MILLI: i64 = TICKS_PER_SECOND / 1000;

/// Media timestamp or duration, counted in 100 ns ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaTime {
    ticks: i64,
}

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime { ticks: 0 };

    pub const fn from_ticks(ticks: i64) -> Self {
        Self { ticks }
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self {
            ticks: millis * TICKS_PER_MILLI,
        }
    }

    /// Create a timestamp from a duration, saturating on overflow
    pub fn from_duration(duration: Duration) -> Self {
        let ticks = duration.as_nanos() / 100;
        Self {
            ticks: i64::try_from(ticks).unwrap_or(i64::MAX),
        }
    }

    /// Length of one frame at `num / den` frames per second.
    ///
    /// Returns zero for a degenerate rate.
    pub fn from_frame_rate(num: u32, den: u32) -> Self {
        if num == 0 || den == 0 {
            return Self::ZERO;
        }
        Self {
            ticks: TICKS_PER_SECOND * den as i64 / num as i64,
        }
    }

    /// Length of `samples` audio frames at `sample_rate` Hz
    pub fn from_samples(samples: u32, sample_rate: u32) -> Self {
        if sample_rate == 0 {
            return Self::ZERO;
        }
        Self {
            ticks: TICKS_PER_SECOND * samples as i64 / sample_rate as i64,
        }
    }

    pub const fn ticks(&self) -> i64 {
        self.ticks
    }

    pub const fn as_millis(&self) -> i64 {
        self.ticks / TICKS_PER_MILLI
    }

    /// Convert to duration; negative values clamp to zero
    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.ticks.max(0) as u64 * 100)
    }

    pub const fn is_positive(&self) -> bool {
        self.ticks > 0
    }
}

impl Add for MediaTime {
    type Output = MediaTime;

    fn add(self, rhs: MediaTime) -> MediaTime {
        MediaTime::from_ticks(self.ticks.saturating_add(rhs.ticks))
    }
}

impl AddAssign for MediaTime {
    fn add_assign(&mut self, rhs: MediaTime) {
        *self = *self + rhs;
    }
}

impl Sub for MediaTime {
    type Output = MediaTime;

    fn sub(self, rhs: MediaTime) -> MediaTime {
        MediaTime::from_ticks(self.ticks.saturating_sub(rhs.ticks))
    }
}

impl std::fmt::Display for MediaTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}ms", self.ticks as f64 / TICKS_PER_MILLI as f64)
    }
}

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// Decoded media payload kept in a [`Pool`](crate::pool::Pool)
///
/// Timing is atomic so that a stage can restamp a sample that is already
/// shared with other consumers. The data buffer sits behind its own lock; the
/// guard returned by [`MediaSample::lock`] is the exclusive checked-out view.
pub struct MediaSample {
    kind: MediaKind,
    time: AtomicI64,
    duration: AtomicI64,
    buffer: Mutex<SampleBuffer>,
}

impl MediaSample {
    /// Create a sample with a zeroed buffer of `capacity` bytes
    pub fn new(kind: MediaKind, capacity: usize) -> Self {
        Self {
            kind,
            time: AtomicI64::new(0),
            duration: AtomicI64::new(0),
            buffer: Mutex::new(SampleBuffer {
                data: vec![0; capacity],
                len: 0,
            }),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn time(&self) -> MediaTime {
        MediaTime::from_ticks(self.time.load(Ordering::Acquire))
    }

    pub fn set_time(&self, time: MediaTime) {
        self.time.store(time.ticks(), Ordering::Release);
    }

    pub fn duration(&self) -> MediaTime {
        MediaTime::from_ticks(self.duration.load(Ordering::Acquire))
    }

    pub fn set_duration(&self, duration: MediaTime) {
        self.duration.store(duration.ticks(), Ordering::Release);
    }

    /// Check out the data buffer
    pub fn lock(&self) -> MutexGuard<'_, SampleBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MediaSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSample")
            .field("kind", &self.kind)
            .field("time", &self.time())
            .field("duration", &self.duration())
            .finish()
    }
}

/// Byte storage of a [`MediaSample`]; `len` marks the valid prefix
#[derive(Debug)]
pub struct SampleBuffer {
    data: Vec<u8>,
    len: usize,
}

impl SampleBuffer {
    /// Valid data
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Whole backing storage, for producers writing in place
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn set_len(&mut self, len: usize) -> Result<()> {
        ensure!(
            len <= self.data.len(),
            "sample length {} exceeds buffer capacity {}",
            len,
            self.data.len()
        );
        self.len = len;
        Ok(())
    }

    /// Replace the valid data with `bytes`
    pub fn fill_from(&mut self, bytes: &[u8]) -> Result<()> {
        self.set_len(bytes.len())?;
        self.data[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Compressed output of an encoder
#[derive(Clone)]
pub struct EncodedPacket {
    pub kind: MediaKind,
    pub data: Bytes,
    pub time: MediaTime,
    pub duration: MediaTime,
    pub is_keyframe: bool,
}

impl EncodedPacket {
    pub fn new(kind: MediaKind, data: Bytes, time: MediaTime, duration: MediaTime) -> Self {
        Self {
            kind,
            data,
            time,
            duration,
            is_keyframe: false,
        }
    }

    pub fn with_keyframe(mut self, is_keyframe: bool) -> Self {
        self.is_keyframe = is_keyframe;
        self
    }

    /// Get the size of the packet data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for EncodedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedPacket")
            .field("kind", &self.kind)
            .field("time", &self.time)
            .field("duration", &self.duration)
            .field("is_keyframe", &self.is_keyframe)
            .field("size", &self.size())
            .finish()
    }
}

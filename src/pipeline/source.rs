//! Source stage: demux, decode and pace
//!
//! Each cycle reads at most one compressed unit, decodes it into the paced
//! queue of its kind and then drains the queues downstream. Once a queue
//! reaches its ceiling the stage stops reading and only drains, which pushes
//! backpressure back to the demuxer.

use anyhow::{Result, bail};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::clock::{Clock, SystemClock};
use super::health::StageMetrics;
use super::pacing::PacedQueue;
use super::types::{MediaKind, MediaTime};
use crate::codec::{CompressedUnit, Decoder, Demuxer, ReadOutcome, StreamInfo};
use crate::config::EngineConfig;
use crate::error::CodecError;
use crate::transport::{MediaEvent, Sender};
use crate::workers::{CycleContext, CycleLogic};

const REOPENED_WAIT: Duration = Duration::from_millis(20);
const REOPEN_FAILED_WAIT: Duration = Duration::from_millis(200);
const READ_FAILED_WAIT: Duration = Duration::from_millis(10);
const DECODER_RESET_WAIT: Duration = Duration::from_millis(10);

/// Observable progress of a [`SourceStage`]
#[derive(Debug, Default)]
pub struct SourceStatus {
    opened: AtomicBool,
    end_of_stream: AtomicBool,
    info: Mutex<Option<StreamInfo>>,
}

impl SourceStatus {
    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// The demuxer reported the end of its input
    pub fn reached_end(&self) -> bool {
        self.end_of_stream.load(Ordering::Acquire)
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct SourceStage {
    demuxer: Box<dyn Demuxer>,
    decoders: Vec<Box<dyn Decoder>>,
    /// Audio before video: the order in which queues are drained
    queues: Vec<PacedQueue>,
    info: Option<StreamInfo>,
    output: Arc<Sender<MediaEvent>>,
    clock: Arc<dyn Clock>,
    real_time: bool,
    start_time: Option<MediaTime>,
    /// Clock reading when a network read failed; the downtime is taken off
    /// the timeline once the source is back
    lost_at: Option<MediaTime>,
    reopen_attempts: u32,
    decoder_resets: u32,
    end_of_stream: bool,
    status: Arc<SourceStatus>,
    metrics: Arc<StageMetrics>,
    config: EngineConfig,
}

impl SourceStage {
    pub fn new(demuxer: Box<dyn Demuxer>, config: &EngineConfig) -> Self {
        Self {
            demuxer,
            decoders: Vec::new(),
            queues: Vec::new(),
            info: None,
            output: Arc::new(Sender::new()),
            clock: Arc::new(SystemClock::new()),
            real_time: true,
            start_time: None,
            lost_at: None,
            reopen_attempts: 0,
            decoder_resets: 0,
            end_of_stream: false,
            status: Arc::new(SourceStatus::default()),
            metrics: Arc::new(StageMetrics::new()),
            config: config.clone(),
        }
    }

    /// Decoder for one media kind; units of kinds without a decoder are skipped
    pub fn with_decoder(mut self, decoder: Box<dyn Decoder>) -> Self {
        self.decoders.retain(|d| d.kind() != decoder.kind());
        self.decoders.push(decoder);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// `false` drains as fast as listeners accept
    pub fn with_real_time(mut self, real_time: bool) -> Self {
        self.real_time = real_time;
        self
    }

    pub fn output(&self) -> Arc<Sender<MediaEvent>> {
        self.output.clone()
    }

    pub fn status(&self) -> Arc<SourceStatus> {
        self.status.clone()
    }

    pub fn metrics(&self) -> Arc<StageMetrics> {
        self.metrics.clone()
    }

    /// Kinds this source decodes
    pub fn kinds(&self) -> Vec<MediaKind> {
        self.decoders.iter().map(|d| d.kind()).collect()
    }

    pub fn is_opened(&self) -> bool {
        self.info.is_some()
    }

    /// Open the demuxer and initialize the decoders. Does nothing if already
    /// open.
    pub fn open(&mut self) -> Result<StreamInfo, CodecError> {
        if let Some(info) = &self.info {
            return Ok(info.clone());
        }

        let info = self.demuxer.open()?;
        for decoder in &mut self.decoders {
            if info.has(decoder.kind()) {
                decoder.initialize(&info)?;
            }
        }

        // queues survive a reopen with their samples and timeline cursor
        let mut previous = std::mem::take(&mut self.queues);
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if !info.has(kind) || !self.decoders.iter().any(|d| d.kind() == kind) {
                continue;
            }
            if let Some(index) = previous.iter().position(|q| q.kind() == kind) {
                self.queues.push(previous.swap_remove(index));
                continue;
            }
            let nominal = match kind {
                MediaKind::Video => info.video.map(|v| v.frame_duration()),
                MediaKind::Audio => info
                    .audio
                    .map(|a| a.block_duration(self.config.audio_block_len)),
            }
            .unwrap_or(MediaTime::ZERO);
            self.queues
                .push(PacedQueue::new(kind, nominal, self.config.cache_count(kind)));
        }
        for queue in previous {
            warn!(
                "SourceStage: {} stream gone after reopen, dropping {} samples",
                queue.kind(),
                queue.len()
            );
            for _ in 0..queue.len() {
                self.metrics.record_dropped();
            }
        }

        self.status.opened.store(true, Ordering::Release);
        *self.status.info.lock().unwrap_or_else(PoisonError::into_inner) = Some(info.clone());
        self.info = Some(info.clone());
        info!("SourceStage: opened ({} streams)", self.queues.len());
        Ok(info)
    }

    fn close(&mut self) {
        self.demuxer.close();
        self.info = None;
        self.status.opened.store(false, Ordering::Release);
    }

    fn is_saturated(&self) -> bool {
        self.queues.iter().any(|q| q.is_saturated())
    }

    fn queued(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    fn drain(&mut self, elapsed: MediaTime) {
        let output = &self.output;
        let metrics = &self.metrics;
        let real_time = self.real_time;

        for queue in &mut self.queues {
            let mut post = |event: &MediaEvent| output.post(event);
            let report = if real_time {
                queue.drain_real_time(elapsed, &mut post)
            } else {
                queue.drain_all(&mut post)
            };
            for _ in 0..report.posted {
                metrics.record_posted();
            }
            if report.rejected {
                metrics.record_rejected();
            }
        }
    }

    /// Decode one unit. Returns the wait a device fault asks for, zero
    /// otherwise; an error once the decoder keeps faulting past its budget.
    fn decode(&mut self, unit: CompressedUnit) -> Result<Duration> {
        let Some(decoder) = self.decoders.iter_mut().find(|d| d.kind() == unit.kind) else {
            return Ok(Duration::ZERO);
        };

        let mut wait = Duration::ZERO;
        match decoder.decode(&unit) {
            Ok(()) => self.decoder_resets = 0,
            Err(e) if e.is_recoverable() => {
                self.metrics.record_decode_failure();
                if self.decoder_resets >= self.config.decoder_reset_attempts {
                    bail!(
                        "{} decoder still failing after {} resets: {}",
                        unit.kind,
                        self.decoder_resets,
                        e
                    );
                }
                self.decoder_resets += 1;
                self.metrics.record_device_reset();
                warn!(
                    "SourceStage: {} decoder fault ({}), reset {}",
                    unit.kind, e, self.decoder_resets
                );
                if let Some(info) = &self.info
                    && let Err(e) = decoder.initialize(info)
                {
                    warn!("SourceStage: {} decoder reinit failed: {}", unit.kind, e);
                }
                wait = match e {
                    CodecError::DeviceHung => self.config.device_hang_backoff(),
                    _ => DECODER_RESET_WAIT,
                };
            }
            Err(e) => {
                self.metrics.record_decode_failure();
                warn!("SourceStage: dropped undecodable {} unit: {}", unit.kind, e);
            }
        }

        self.collect(unit.kind);
        Ok(wait)
    }

    /// Move decoded output into the paced queue of `kind`
    fn collect(&mut self, kind: MediaKind) {
        let Some(decoder) = self.decoders.iter_mut().find(|d| d.kind() == kind) else {
            return;
        };
        match self.queues.iter_mut().find(|q| q.kind() == kind) {
            Some(queue) => {
                while let Some(sample) = decoder.take_sample() {
                    queue.push(sample);
                }
            }
            None => {
                while decoder.take_sample().is_some() {
                    self.metrics.record_dropped();
                }
            }
        }
    }

    fn begin_end_of_stream(&mut self) {
        let kinds: Vec<MediaKind> = self.decoders.iter().map(|d| d.kind()).collect();
        for decoder in &mut self.decoders {
            if let Err(e) = decoder.flush() {
                warn!("SourceStage: {} decoder flush failed: {}", decoder.kind(), e);
            }
        }
        for kind in kinds {
            self.collect(kind);
        }

        self.end_of_stream = true;
        self.status.end_of_stream.store(true, Ordering::Release);
        info!(
            "SourceStage: end of stream, {} samples left to drain",
            self.queued()
        );
    }

    fn reopen(&mut self, ctx: &mut CycleContext) -> Duration {
        if self.reopen_attempts >= self.config.source_reopen_attempts {
            error!(
                "SourceStage: giving up after {} reopen attempts",
                self.reopen_attempts
            );
            ctx.mark_as_stop();
            return Duration::ZERO;
        }

        self.reopen_attempts += 1;
        self.close();
        match self.open() {
            Ok(_) => {
                self.metrics.record_device_reset();
                if let Some(lost_at) = self.lost_at.take()
                    && let Some(start) = self.start_time.as_mut()
                {
                    *start += self.clock.now() - lost_at;
                }
                REOPENED_WAIT
            }
            Err(e) => {
                debug!(
                    "SourceStage: reopen attempt {} failed: {}",
                    self.reopen_attempts, e
                );
                REOPEN_FAILED_WAIT
            }
        }
    }
}

impl CycleLogic for SourceStage {
    fn start(&mut self) -> Result<()> {
        self.start_time = None;
        if let Err(e) = self.open() {
            if !self.demuxer.is_network() {
                return Err(anyhow::Error::new(e).context("failed to open source"));
            }
            warn!("SourceStage: network source not available yet: {}", e);
        }
        Ok(())
    }

    fn execute_cycle(&mut self, ctx: &mut CycleContext) -> Result<Duration> {
        if self.info.is_none() {
            if !self.demuxer.is_network() {
                ctx.mark_as_stop();
                return Ok(Duration::ZERO);
            }
            return Ok(self.reopen(ctx));
        }

        let now = self.clock.now();
        let start = *self.start_time.get_or_insert(now);
        let elapsed = now - start;
        let period = self.config.timing_period();

        if self.end_of_stream {
            self.drain(elapsed);
            if self.queued() > 0 {
                return Ok(period);
            }
            if !self.output.post(&MediaEvent::EndOfStream) {
                debug!("SourceStage: end of stream not accepted by any listener");
            }
            ctx.mark_as_stop();
            return Ok(Duration::ZERO);
        }

        if self.is_saturated() {
            self.drain(elapsed);
            return Ok(period);
        }

        match self.demuxer.read_next() {
            Ok(ReadOutcome::Unit(unit)) => {
                let wait = self.decode(unit)?;
                if !wait.is_zero() {
                    self.drain(elapsed);
                    return Ok(wait);
                }
            }
            Ok(ReadOutcome::Skip) => {}
            Ok(ReadOutcome::EndOfStream) => self.begin_end_of_stream(),
            Err(e) if self.demuxer.is_network() => {
                warn!("SourceStage: network read failed, reopening: {}", e);
                self.lost_at = Some(now);
                self.close();
                return Ok(READ_FAILED_WAIT);
            }
            Err(e) => {
                debug!("SourceStage: read failed: {}", e);
                return Ok(READ_FAILED_WAIT);
            }
        }

        self.drain(elapsed);

        if self.end_of_stream || self.is_saturated() {
            return Ok(period);
        }
        Ok(Duration::ZERO)
    }

    fn on_disposing(&mut self) {
        for queue in &mut self.queues {
            queue.reset();
        }
        self.demuxer.close();
        self.output.clear();
    }
}

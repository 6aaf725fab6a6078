//! Sink stage: writes encoded packets through a [`PacketSink`]
//!
//! Packets of every kind share one inbox; each kind is bounded by its own
//! cache count. A failed write keeps the packet for the next cycle, and a run
//! of failures reopens the sink.

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::health::StageMetrics;
use super::types::{EncodedPacket, MediaKind};
use crate::codec::PacketSink;
use crate::config::EngineConfig;
use crate::transport::{Inbox, Listener, MediaEvent};
use crate::workers::{CycleContext, CycleLogic};

const EMPTY_WAIT: Duration = Duration::from_millis(5);
const WRITE_FAILED_WAIT: Duration = Duration::from_millis(10);

pub struct SinkInput {
    inbox: Inbox<EncodedPacket>,
    video_queued: AtomicUsize,
    audio_queued: AtomicUsize,
    video_limit: usize,
    audio_limit: usize,
    end_of_streams: AtomicUsize,
    expected_streams: AtomicUsize,
    holding: AtomicBool,
    finished: AtomicBool,
    metrics: Arc<StageMetrics>,
}

impl SinkInput {
    fn new(config: &EngineConfig, metrics: Arc<StageMetrics>) -> Self {
        let video_limit = config.cache_count(MediaKind::Video);
        let audio_limit = config.cache_count(MediaKind::Audio);
        Self {
            inbox: Inbox::new(video_limit + audio_limit),
            video_queued: AtomicUsize::new(0),
            audio_queued: AtomicUsize::new(0),
            video_limit,
            audio_limit,
            end_of_streams: AtomicUsize::new(0),
            expected_streams: AtomicUsize::new(1),
            holding: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            metrics,
        }
    }

    fn counter(&self, kind: MediaKind) -> &AtomicUsize {
        match kind {
            MediaKind::Video => &self.video_queued,
            MediaKind::Audio => &self.audio_queued,
        }
    }

    fn limit(&self, kind: MediaKind) -> usize {
        match kind {
            MediaKind::Video => self.video_limit,
            MediaKind::Audio => self.audio_limit,
        }
    }

    fn pop(&self) -> Option<EncodedPacket> {
        let packet = self.inbox.pop()?;
        self.counter(packet.kind).fetch_sub(1, Ordering::AcqRel);
        Some(packet)
    }

    pub fn queued(&self) -> usize {
        self.inbox.len()
    }

    /// Number of upstream streams whose end of stream completes the sink
    pub fn set_expected_streams(&self, streams: usize) {
        self.expected_streams.store(streams.max(1), Ordering::Release);
    }

    pub fn all_streams_ended(&self) -> bool {
        self.end_of_streams.load(Ordering::Acquire) >= self.expected_streams.load(Ordering::Acquire)
    }

    /// A packet is queued or being written
    pub fn is_sinking(&self) -> bool {
        self.holding.load(Ordering::Acquire) || !self.inbox.is_empty()
    }

    /// Every stream ended and every packet was written
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl Listener<MediaEvent> for SinkInput {
    fn queue_event(&self, event: &MediaEvent) -> bool {
        match event {
            MediaEvent::Packet(packet) => {
                let counter = self.counter(packet.kind);
                let limit = self.limit(packet.kind);
                let reserved = counter
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                        (queued < limit).then_some(queued + 1)
                    })
                    .is_ok();
                if !reserved || self.is_finished() {
                    if reserved {
                        counter.fetch_sub(1, Ordering::AcqRel);
                    }
                    self.metrics.record_rejected();
                    return false;
                }
                match self.inbox.try_push(packet.clone()) {
                    Ok(()) => true,
                    Err(_) => {
                        counter.fetch_sub(1, Ordering::AcqRel);
                        self.metrics.record_rejected();
                        false
                    }
                }
            }
            MediaEvent::EndOfStream => {
                self.end_of_streams.fetch_add(1, Ordering::AcqRel);
                true
            }
            MediaEvent::Sample(_) => false,
        }
    }
}

pub struct SinkStage {
    input: Arc<SinkInput>,
    sink: Box<dyn PacketSink>,
    current: Option<EncodedPacket>,
    opened: bool,
    failures: u32,
    reopens: u32,
    metrics: Arc<StageMetrics>,
    config: EngineConfig,
}

impl SinkStage {
    pub fn new(sink: Box<dyn PacketSink>, config: &EngineConfig) -> Self {
        let metrics = Arc::new(StageMetrics::new());
        Self {
            input: Arc::new(SinkInput::new(config, metrics.clone())),
            sink,
            current: None,
            opened: false,
            failures: 0,
            reopens: 0,
            metrics,
            config: config.clone(),
        }
    }

    pub fn with_expected_streams(self, streams: usize) -> Self {
        self.input.set_expected_streams(streams);
        self
    }

    pub fn input(&self) -> Arc<SinkInput> {
        self.input.clone()
    }

    pub fn metrics(&self) -> Arc<StageMetrics> {
        self.metrics.clone()
    }

    fn reopen(&mut self) -> Result<()> {
        self.sink.close();
        self.opened = false;
        self.sink.open().context("failed to reopen sink")?;
        self.opened = true;
        self.metrics.record_device_reset();
        info!("SinkStage: reopened after {} failed writes", self.failures);
        Ok(())
    }
}

impl CycleLogic for SinkStage {
    fn start(&mut self) -> Result<()> {
        self.sink.open().context("failed to open sink")?;
        self.opened = true;
        Ok(())
    }

    fn stop(&mut self) {
        if self.opened {
            self.sink.close();
            self.opened = false;
        }
    }

    fn execute_cycle(&mut self, ctx: &mut CycleContext) -> Result<Duration> {
        let ended = self.input.all_streams_ended();
        let Some(packet) = self.current.take().or_else(|| self.input.pop()) else {
            self.input.holding.store(false, Ordering::Release);
            if ended {
                self.input.finished.store(true, Ordering::Release);
                info!("SinkStage: all streams written, {}", self.metrics.summary());
                ctx.mark_as_stop();
                return Ok(Duration::ZERO);
            }
            return Ok(EMPTY_WAIT);
        };
        self.input.holding.store(true, Ordering::Release);

        match self.sink.write(&packet) {
            Ok(()) => {
                self.failures = 0;
                self.reopens = 0;
                self.metrics.record_posted();
                Ok(Duration::ZERO)
            }
            Err(e) => {
                self.failures += 1;
                debug!("SinkStage: write failed ({}): {}", self.failures, e);
                self.current = Some(packet);
                if self.failures >= self.config.sink_failure_budget {
                    warn!("SinkStage: {} consecutive write failures", self.failures);
                    if self.reopens >= self.config.sink_reopen_attempts {
                        bail!(
                            "sink still failing after {} reopens: {}",
                            self.reopens,
                            e
                        );
                    }
                    self.reopens += 1;
                    self.reopen()?;
                    self.failures = 0;
                }
                Ok(WRITE_FAILED_WAIT)
            }
        }
    }

    fn on_disposing(&mut self) {
        self.current = None;
        while self.input.pop().is_some() {}
    }
}

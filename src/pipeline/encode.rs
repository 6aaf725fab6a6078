//! Encode stage
//!
//! [`EncodeInput`] is the listener side: it copies samples of its kind into a
//! bounded inbox and rejects them once the inbox is full. [`EncodeStage`] is
//! the cycle side: one sample per cycle through the [`Encoder`], packets
//! forwarded downstream. Device faults tear the encoder down and the sample is
//! retried after reinitialization.

use anyhow::{Result, bail};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::health::StageMetrics;
use super::types::{EncodedPacket, MediaKind, MediaSample};
use crate::codec::Encoder;
use crate::config::EngineConfig;
use crate::error::CodecError;
use crate::pool::Pooled;
use crate::transport::{Inbox, Listener, MediaEvent, Sender};
use crate::workers::{CycleContext, CycleLogic};

const EMPTY_WAIT: Duration = Duration::from_millis(5);
const INIT_FAILED_WAIT: Duration = Duration::from_millis(20);
const RECOVER_WAIT: Duration = Duration::from_millis(10);

pub struct EncodeInput {
    kind: MediaKind,
    inbox: Inbox<Pooled<MediaSample>>,
    end_of_stream: AtomicBool,
    holding: AtomicBool,
    finished: AtomicBool,
    metrics: Arc<StageMetrics>,
}

impl EncodeInput {
    fn new(kind: MediaKind, capacity: usize, metrics: Arc<StageMetrics>) -> Self {
        Self {
            kind,
            inbox: Inbox::new(capacity),
            end_of_stream: AtomicBool::new(false),
            holding: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn queued(&self) -> usize {
        self.inbox.len()
    }

    /// A sample is waiting in the inbox or inside the encoder
    pub fn is_encoding(&self) -> bool {
        !self.is_finished() && (self.holding.load(Ordering::Acquire) || !self.inbox.is_empty())
    }

    pub fn reached_end(&self) -> bool {
        self.end_of_stream.load(Ordering::Acquire)
    }

    /// End of stream was forwarded downstream
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl Listener<MediaEvent> for EncodeInput {
    fn queue_event(&self, event: &MediaEvent) -> bool {
        match event {
            MediaEvent::Sample(sample) if sample.kind() == self.kind => {
                if self.reached_end() || self.inbox.is_full() {
                    self.metrics.record_rejected();
                    return false;
                }
                let copy = match sample.try_clone() {
                    Ok(copy) => copy,
                    Err(e) => {
                        warn!("EncodeStage: refused {} sample: {}", self.kind, e);
                        return false;
                    }
                };
                match self.inbox.try_push(copy) {
                    Ok(()) => true,
                    Err(_) => {
                        self.metrics.record_rejected();
                        false
                    }
                }
            }
            MediaEvent::EndOfStream => {
                self.end_of_stream.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }
}

pub struct EncodeStage {
    input: Arc<EncodeInput>,
    encoder: Box<dyn Encoder>,
    output: Arc<Sender<MediaEvent>>,
    pending: VecDeque<EncodedPacket>,
    current: Option<Pooled<MediaSample>>,
    initialized: bool,
    flushed: bool,
    attempts: u32,
    metrics: Arc<StageMetrics>,
    config: EngineConfig,
}

impl EncodeStage {
    pub fn new(kind: MediaKind, encoder: Box<dyn Encoder>, config: &EngineConfig) -> Self {
        let metrics = Arc::new(StageMetrics::new());
        Self {
            input: Arc::new(EncodeInput::new(
                kind,
                config.cache_count(kind),
                metrics.clone(),
            )),
            encoder,
            output: Arc::new(Sender::new()),
            pending: VecDeque::new(),
            current: None,
            initialized: false,
            flushed: false,
            attempts: 0,
            metrics,
            config: config.clone(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.input.kind
    }

    /// Connect this to the upstream sender
    pub fn input(&self) -> Arc<EncodeInput> {
        self.input.clone()
    }

    pub fn output(&self) -> Arc<Sender<MediaEvent>> {
        self.output.clone()
    }

    pub fn metrics(&self) -> Arc<StageMetrics> {
        self.metrics.clone()
    }

    /// Post buffered packets; false if a packet was rejected
    fn forward(&mut self) -> bool {
        while let Some(packet) = self.pending.pop_front() {
            let event = MediaEvent::Packet(packet);
            if !self.output.post(&event) {
                if let MediaEvent::Packet(packet) = event {
                    self.pending.push_front(packet);
                }
                return false;
            }
            self.metrics.record_posted();
        }
        true
    }

    fn deinitialize(&mut self) {
        if self.initialized {
            self.encoder.deinitialize();
            self.initialized = false;
        }
    }

    fn ensure_initialized(&mut self) -> Result<bool> {
        if self.initialized {
            return Ok(true);
        }
        if self.attempts >= self.config.encoder_init_attempts {
            bail!(
                "{} encoder still failing after {} attempts",
                self.kind(),
                self.attempts
            );
        }

        match self.encoder.initialize() {
            Ok(()) => {
                self.initialized = true;
                info!("EncodeStage: {} encoder initialized", self.kind());
                Ok(true)
            }
            Err(e) => {
                self.encoder.deinitialize();
                self.attempts += 1;
                warn!(
                    "EncodeStage: {} encoder init attempt {} failed: {}",
                    self.kind(),
                    self.attempts,
                    e
                );
                Ok(false)
            }
        }
    }

    fn finish(&mut self, ctx: &mut CycleContext) -> Duration {
        if !self.flushed {
            self.flushed = true;
            if self.initialized {
                let pending = &mut self.pending;
                if let Err(e) = self.encoder.finish(&mut |packet| pending.push_back(packet)) {
                    warn!("EncodeStage: {} encoder finish failed: {}", self.kind(), e);
                }
            }
        }
        if !self.forward() {
            return EMPTY_WAIT;
        }

        if !self.output.post(&MediaEvent::EndOfStream) {
            debug!("EncodeStage: end of stream not accepted by any listener");
        }
        self.input.finished.store(true, Ordering::Release);
        info!("EncodeStage: {} stream complete", self.kind());
        ctx.mark_as_stop();
        Duration::ZERO
    }
}

impl CycleLogic for EncodeStage {
    fn stop(&mut self) {
        self.deinitialize();
    }

    fn execute_cycle(&mut self, ctx: &mut CycleContext) -> Result<Duration> {
        if ctx.is_cancelled() {
            return Ok(Duration::ZERO);
        }
        if !self.forward() {
            return Ok(EMPTY_WAIT);
        }

        let ended = self.input.reached_end();
        let Some(sample) = self.current.take().or_else(|| self.input.inbox.pop()) else {
            self.input.holding.store(false, Ordering::Release);
            if ended {
                return Ok(self.finish(ctx));
            }
            return Ok(EMPTY_WAIT);
        };
        self.input.holding.store(true, Ordering::Release);

        if !self.ensure_initialized()? {
            self.current = Some(sample);
            return Ok(INIT_FAILED_WAIT);
        }

        let pending = &mut self.pending;
        let result = self
            .encoder
            .encode(&sample, ctx.token(), &mut |packet| pending.push_back(packet));

        match result {
            Ok(()) => {
                self.attempts = 0;
                drop(sample);
                self.forward();
                Ok(Duration::ZERO)
            }
            Err(CodecError::DeviceLost) => {
                warn!("EncodeStage: {} device lost, reinitializing", self.kind());
                self.deinitialize();
                self.attempts += 1;
                self.metrics.record_device_reset();
                self.current = Some(sample);
                Ok(RECOVER_WAIT)
            }
            Err(CodecError::DeviceHung) => {
                warn!("EncodeStage: {} device hung, backing off", self.kind());
                self.deinitialize();
                self.attempts += 1;
                self.metrics.record_device_reset();
                self.current = Some(sample);
                Ok(self.config.device_hang_backoff())
            }
            Err(CodecError::Failed(e)) => Err(e.context(format!("{} encode failed", self.kind()))),
        }
    }

    fn on_disposing(&mut self) {
        self.current = None;
        self.input.inbox.clear();
        self.pending.clear();
        self.output.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{Collector, FakeEncoder, Seen};
    use crate::pipeline::types::MediaTime;
    use crate::pool::Pool;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> CycleContext {
        CycleContext::new(Arc::from("encoder"), CancellationToken::new())
    }

    fn pool(kind: MediaKind) -> Pool<MediaSample> {
        Pool::new(8, 0, move || Ok(MediaSample::new(kind, 8))).unwrap()
    }

    fn sample_event(pool: &Pool<MediaSample>, millis: i64) -> MediaEvent {
        let sample = pool.get().unwrap().unwrap();
        sample.set_time(MediaTime::from_millis(millis));
        sample.set_duration(MediaTime::from_millis(40));
        MediaEvent::Sample(sample)
    }

    fn stage(encoder: FakeEncoder, config: &EngineConfig) -> (EncodeStage, Arc<Collector>) {
        let stage = EncodeStage::new(MediaKind::Video, Box::new(encoder), config);
        let collector = Collector::accepting();
        stage.output().connect_to(collector.clone());
        (stage, collector)
    }

    #[test]
    fn test_encodes_and_forwards_packets() {
        let (mut stage, collector) = stage(FakeEncoder::new(MediaKind::Video), &EngineConfig::default());
        let pool = pool(MediaKind::Video);
        let input = stage.input();

        assert!(input.queue_event(&sample_event(&pool, 0)));
        assert!(input.queue_event(&sample_event(&pool, 40)));
        assert!(input.is_encoding());

        let mut ctx = ctx();
        stage.execute_cycle(&mut ctx).unwrap();
        stage.execute_cycle(&mut ctx).unwrap();
        assert_eq!(
            stage.execute_cycle(&mut ctx).unwrap(),
            Duration::from_millis(5)
        );

        assert_eq!(
            collector.seen(),
            vec![
                Seen::Packet { kind: MediaKind::Video, time: MediaTime::ZERO },
                Seen::Packet { kind: MediaKind::Video, time: MediaTime::from_millis(40) },
            ]
        );
        assert!(!input.is_encoding());
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_inbox_rejects_when_full() {
        let (stage, _) = stage(FakeEncoder::new(MediaKind::Video), &EngineConfig::default());
        let video = pool(MediaKind::Video);
        let audio = pool(MediaKind::Audio);
        let input = stage.input();

        for i in 0..6 {
            assert!(input.queue_event(&sample_event(&video, i * 40)));
        }
        assert!(!input.queue_event(&sample_event(&video, 240)));
        assert!(!input.queue_event(&sample_event(&audio, 0)));
        assert_eq!(input.queued(), 6);
        assert_eq!(stage.metrics().rejected(), 1);
    }

    #[test]
    fn test_device_lost_retries_sample() {
        let encoder = FakeEncoder::new(MediaKind::Video).with_faults(vec![CodecError::DeviceLost]);
        let counters = encoder.counters();
        let (mut stage, collector) = stage(encoder, &EngineConfig::default());
        let pool = pool(MediaKind::Video);
        stage.input().queue_event(&sample_event(&pool, 0));

        let mut ctx = ctx();
        assert_eq!(stage.execute_cycle(&mut ctx).unwrap(), RECOVER_WAIT);
        assert_eq!(counters.deinits.load(Ordering::SeqCst), 1);
        assert_eq!(collector.seen().len(), 0);

        assert_eq!(stage.execute_cycle(&mut ctx).unwrap(), Duration::ZERO);
        assert_eq!(counters.inits.load(Ordering::SeqCst), 2);
        assert_eq!(counters.encodes.load(Ordering::SeqCst), 1);
        assert_eq!(collector.seen().len(), 1);
        assert_eq!(stage.metrics().device_resets(), 1);
    }

    #[test]
    fn test_hung_device_backs_off() {
        let config = EngineConfig::default();
        let encoder = FakeEncoder::new(MediaKind::Video).with_faults(vec![CodecError::DeviceHung]);
        let (mut stage, _) = stage(encoder, &config);
        let pool = pool(MediaKind::Video);
        stage.input().queue_event(&sample_event(&pool, 0));

        assert_eq!(
            stage.execute_cycle(&mut ctx()).unwrap(),
            config.device_hang_backoff()
        );
    }

    #[test]
    fn test_init_budget_escalates() {
        let config = EngineConfig {
            encoder_init_attempts: 3,
            ..EngineConfig::default()
        };
        let encoder = FakeEncoder::new(MediaKind::Video).failing_init(10);
        let counters = encoder.counters();
        let (mut stage, _) = stage(encoder, &config);
        let pool = pool(MediaKind::Video);
        stage.input().queue_event(&sample_event(&pool, 0));

        let mut ctx = ctx();
        for _ in 0..3 {
            assert_eq!(stage.execute_cycle(&mut ctx).unwrap(), INIT_FAILED_WAIT);
        }
        assert!(stage.execute_cycle(&mut ctx).is_err());
        assert_eq!(counters.inits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_repeated_device_faults_escalate() {
        let config = EngineConfig {
            encoder_init_attempts: 3,
            ..EngineConfig::default()
        };
        let encoder = FakeEncoder::new(MediaKind::Video).with_faults(vec![
            CodecError::DeviceLost,
            CodecError::DeviceHung,
            CodecError::DeviceLost,
            CodecError::DeviceLost,
        ]);
        let counters = encoder.counters();
        let (mut stage, collector) = stage(encoder, &config);
        let pool = pool(MediaKind::Video);
        stage.input().queue_event(&sample_event(&pool, 0));

        let mut ctx = ctx();
        assert_eq!(stage.execute_cycle(&mut ctx).unwrap(), RECOVER_WAIT);
        assert_eq!(
            stage.execute_cycle(&mut ctx).unwrap(),
            config.device_hang_backoff()
        );
        assert_eq!(stage.execute_cycle(&mut ctx).unwrap(), RECOVER_WAIT);
        assert!(stage.execute_cycle(&mut ctx).is_err());

        assert_eq!(counters.inits.load(Ordering::SeqCst), 3);
        assert_eq!(counters.encodes.load(Ordering::SeqCst), 0);
        assert_eq!(stage.metrics().device_resets(), 3);
        assert!(collector.seen().is_empty());
    }

    #[test]
    fn test_generic_failure_is_fatal() {
        let encoder = FakeEncoder::new(MediaKind::Video)
            .with_faults(vec![CodecError::Failed(anyhow::anyhow!("bitstream overflow"))]);
        let (mut stage, _) = stage(encoder, &EngineConfig::default());
        let pool = pool(MediaKind::Video);
        stage.input().queue_event(&sample_event(&pool, 0));

        assert!(stage.execute_cycle(&mut ctx()).is_err());
    }

    #[test]
    fn test_end_of_stream_forwarded_after_drain() {
        let (mut stage, collector) = stage(FakeEncoder::new(MediaKind::Video), &EngineConfig::default());
        let pool = pool(MediaKind::Video);
        let input = stage.input();
        input.queue_event(&sample_event(&pool, 0));
        input.queue_event(&sample_event(&pool, 40));
        assert!(input.queue_event(&MediaEvent::EndOfStream));
        assert!(!input.queue_event(&sample_event(&pool, 80)));

        let mut ctx = ctx();
        let mut cycles = 0;
        while !ctx.stop_requested() && cycles < 10 {
            stage.execute_cycle(&mut ctx).unwrap();
            cycles += 1;
        }

        let seen = collector.seen();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], Seen::EndOfStream);
        assert!(input.is_finished());
        assert!(!input.is_encoding());
    }

    #[test]
    fn test_rejected_packets_are_kept() {
        let (mut stage, collector) = stage(FakeEncoder::new(MediaKind::Video), &EngineConfig::default());
        collector.set_accepting(false);
        let pool = pool(MediaKind::Video);
        stage.input().queue_event(&sample_event(&pool, 0));

        let mut ctx = ctx();
        stage.execute_cycle(&mut ctx).unwrap();
        assert_eq!(stage.execute_cycle(&mut ctx).unwrap(), EMPTY_WAIT);
        assert!(collector.seen().is_empty());

        collector.set_accepting(true);
        stage.execute_cycle(&mut ctx).unwrap();
        assert_eq!(collector.seen().len(), 1);
    }
}

//! Scripted codec fakes shared by the stage tests

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use super::types::{EncodedPacket, MediaKind, MediaSample, MediaTime};
use crate::codec::{
    AudioParams, CompressedUnit, Decoder, Demuxer, Encoder, PacketSink, ReadOutcome, StreamInfo,
    VideoParams,
};
use crate::error::CodecError;
use crate::pool::{Pool, Pooled};
use crate::transport::{Listener, MediaEvent};

const UNIT_MS: i64 = 40;

pub(crate) struct FakeDemuxer {
    kinds: Vec<MediaKind>,
    remaining: Option<usize>,
    available: bool,
    network: bool,
    failing_read: Option<usize>,
    reads: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
    produced: usize,
}

impl FakeDemuxer {
    fn build(kinds: Vec<MediaKind>, remaining: Option<usize>) -> Self {
        Self {
            kinds,
            remaining,
            available: true,
            network: false,
            failing_read: None,
            reads: Arc::new(AtomicUsize::new(0)),
            opens: Arc::new(AtomicUsize::new(0)),
            produced: 0,
        }
    }

    pub(crate) fn endless(kind: MediaKind) -> Self {
        Self::build(vec![kind], None)
    }

    pub(crate) fn finite(kind: MediaKind, units: usize) -> Self {
        Self::build(vec![kind], Some(units))
    }

    /// Alternates video and audio units
    pub(crate) fn mixed(units: usize) -> Self {
        Self::build(vec![MediaKind::Video, MediaKind::Audio], Some(units))
    }

    pub(crate) fn unavailable(network: bool) -> Self {
        let mut demuxer = Self::build(vec![MediaKind::Video], None);
        demuxer.available = false;
        demuxer.network = network;
        demuxer
    }

    pub(crate) fn over_network(mut self) -> Self {
        self.network = true;
        self
    }

    /// Fail the `n`th read (1-based) once
    pub(crate) fn failing_read(mut self, n: usize) -> Self {
        self.failing_read = Some(n);
        self
    }

    pub(crate) fn reads(&self) -> Arc<AtomicUsize> {
        self.reads.clone()
    }

    pub(crate) fn opens(&self) -> Arc<AtomicUsize> {
        self.opens.clone()
    }
}

impl Demuxer for FakeDemuxer {
    fn open(&mut self) -> Result<StreamInfo, CodecError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.available {
            return Err(CodecError::Failed(anyhow::anyhow!("input not reachable")));
        }

        let mut info = StreamInfo::default();
        if self.kinds.contains(&MediaKind::Video) {
            info.video = Some(VideoParams {
                width: 320,
                height: 240,
                frame_rate_num: 25,
                frame_rate_den: 1,
            });
        }
        if self.kinds.contains(&MediaKind::Audio) {
            info.audio = Some(AudioParams {
                sample_rate: 48_000,
                channels: 2,
                bits_per_sample: 16,
            });
        }
        Ok(info)
    }

    fn read_next(&mut self) -> Result<ReadOutcome, CodecError> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_read == Some(read) {
            return Err(CodecError::Failed(anyhow::anyhow!("connection reset")));
        }
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Ok(ReadOutcome::EndOfStream);
            }
            *remaining -= 1;
        }

        let kind = self.kinds[self.produced % self.kinds.len()];
        let index = (self.produced / self.kinds.len()) as i64;
        self.produced += 1;
        Ok(ReadOutcome::Unit(CompressedUnit {
            kind,
            data: Bytes::from_static(b"unit"),
            time: MediaTime::from_millis(index * UNIT_MS),
            duration: MediaTime::from_millis(UNIT_MS),
            is_keyframe: index == 0,
        }))
    }

    fn close(&mut self) {}

    fn is_network(&self) -> bool {
        self.network
    }
}

pub(crate) struct FakeDecoder {
    kind: MediaKind,
    pool: Pool<MediaSample>,
    output: VecDeque<Pooled<MediaSample>>,
    decodes: usize,
    fail_every: Option<usize>,
    faults: VecDeque<CodecError>,
    inits: Arc<AtomicUsize>,
}

impl FakeDecoder {
    pub(crate) fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            pool: Pool::new(4, 0, move || Ok(MediaSample::new(kind, 16))).unwrap(),
            output: VecDeque::new(),
            decodes: 0,
            fail_every: None,
            faults: VecDeque::new(),
            inits: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn fail_every(&mut self, n: usize) {
        self.fail_every = Some(n);
    }

    /// Fail upcoming decode calls, one fault each
    pub(crate) fn with_faults(mut self, faults: Vec<CodecError>) -> Self {
        self.faults = faults.into();
        self
    }

    pub(crate) fn inits(&self) -> Arc<AtomicUsize> {
        self.inits.clone()
    }
}

impl Decoder for FakeDecoder {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn initialize(&mut self, _info: &StreamInfo) -> Result<(), CodecError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn decode(&mut self, unit: &CompressedUnit) -> Result<(), CodecError> {
        if let Some(fault) = self.faults.pop_front() {
            return Err(fault);
        }
        self.decodes += 1;
        if let Some(n) = self.fail_every
            && self.decodes % n == 0
        {
            return Err(CodecError::Failed(anyhow::anyhow!("corrupt unit")));
        }

        let sample = self
            .pool
            .get()
            .map_err(|e| CodecError::Failed(e.into()))?
            .ok_or_else(|| CodecError::Failed(anyhow::anyhow!("sample pool exhausted")))?;
        sample
            .lock()
            .fill_from(&unit.data)
            .map_err(CodecError::Failed)?;
        sample.set_time(unit.time);
        sample.set_duration(unit.duration);
        self.output.push_back(sample);
        Ok(())
    }

    fn take_sample(&mut self) -> Option<Pooled<MediaSample>> {
        self.output.pop_front()
    }
}

#[derive(Default)]
pub(crate) struct EncoderCounters {
    pub(crate) inits: AtomicUsize,
    pub(crate) deinits: AtomicUsize,
    pub(crate) encodes: AtomicUsize,
}

pub(crate) struct FakeEncoder {
    kind: MediaKind,
    init_failures: usize,
    faults: VecDeque<CodecError>,
    counters: Arc<EncoderCounters>,
}

impl FakeEncoder {
    pub(crate) fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            init_failures: 0,
            faults: VecDeque::new(),
            counters: Arc::new(EncoderCounters::default()),
        }
    }

    /// Fail the next `n` initializations
    pub(crate) fn failing_init(mut self, n: usize) -> Self {
        self.init_failures = n;
        self
    }

    /// Fail upcoming encode calls, one fault each
    pub(crate) fn with_faults(mut self, faults: Vec<CodecError>) -> Self {
        self.faults = faults.into();
        self
    }

    pub(crate) fn counters(&self) -> Arc<EncoderCounters> {
        self.counters.clone()
    }
}

impl Encoder for FakeEncoder {
    fn initialize(&mut self) -> Result<(), CodecError> {
        self.counters.inits.fetch_add(1, Ordering::SeqCst);
        if self.init_failures > 0 {
            self.init_failures -= 1;
            return Err(CodecError::Failed(anyhow::anyhow!("no encoder session")));
        }
        Ok(())
    }

    fn deinitialize(&mut self) {
        self.counters.deinits.fetch_add(1, Ordering::SeqCst);
    }

    fn encode(
        &mut self,
        sample: &MediaSample,
        _token: &CancellationToken,
        emit: &mut dyn FnMut(EncodedPacket),
    ) -> Result<(), CodecError> {
        if let Some(fault) = self.faults.pop_front() {
            return Err(fault);
        }
        self.counters.encodes.fetch_add(1, Ordering::SeqCst);
        let data = Bytes::copy_from_slice(sample.lock().as_slice());
        emit(EncodedPacket::new(
            self.kind,
            data,
            sample.time(),
            sample.duration(),
        ));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct SinkCounters {
    pub(crate) opens: AtomicUsize,
    pub(crate) closes: AtomicUsize,
    pub(crate) written: Mutex<Vec<(MediaKind, MediaTime)>>,
}

impl SinkCounters {
    pub(crate) fn written(&self) -> Vec<(MediaKind, MediaTime)> {
        self.written.lock().unwrap().clone()
    }
}

pub(crate) struct FakeSink {
    write_failures: usize,
    open_failures: usize,
    counters: Arc<SinkCounters>,
}

impl FakeSink {
    pub(crate) fn new() -> Self {
        Self {
            write_failures: 0,
            open_failures: 0,
            counters: Arc::new(SinkCounters::default()),
        }
    }

    pub(crate) fn failing_writes(mut self, n: usize) -> Self {
        self.write_failures = n;
        self
    }

    pub(crate) fn failing_opens(mut self, n: usize) -> Self {
        self.open_failures = n;
        self
    }

    pub(crate) fn counters(&self) -> Arc<SinkCounters> {
        self.counters.clone()
    }
}

impl PacketSink for FakeSink {
    fn open(&mut self) -> Result<(), CodecError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if self.open_failures > 0 {
            self.open_failures -= 1;
            return Err(CodecError::Failed(anyhow::anyhow!("disk full")));
        }
        Ok(())
    }

    fn write(&mut self, packet: &EncodedPacket) -> Result<(), CodecError> {
        if self.write_failures > 0 {
            self.write_failures -= 1;
            return Err(CodecError::Failed(anyhow::anyhow!("write refused")));
        }
        self.counters
            .written
            .lock()
            .unwrap()
            .push((packet.kind, packet.time));
        Ok(())
    }

    fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Seen {
    Sample { kind: MediaKind, time: MediaTime },
    Packet { kind: MediaKind, time: MediaTime },
    EndOfStream,
}

/// Listener recording what it accepts
pub(crate) struct Collector {
    accepting: AtomicBool,
    seen: Mutex<Vec<Seen>>,
}

impl Collector {
    pub(crate) fn accepting() -> Arc<Self> {
        Arc::new(Self {
            accepting: AtomicBool::new(true),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn rejecting() -> Arc<Self> {
        let collector = Self::accepting();
        collector.set_accepting(false);
        collector
    }

    pub(crate) fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub(crate) fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub(crate) fn samples(&self) -> usize {
        self.seen()
            .iter()
            .filter(|s| matches!(s, Seen::Sample { .. }))
            .count()
    }

    pub(crate) fn sample_times(&self) -> Vec<MediaTime> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Sample { time, .. } => Some(time),
                _ => None,
            })
            .collect()
    }
}

impl Listener<MediaEvent> for Collector {
    fn queue_event(&self, event: &MediaEvent) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        let seen = match event {
            MediaEvent::Sample(sample) => Seen::Sample {
                kind: sample.kind(),
                time: sample.time(),
            },
            MediaEvent::Packet(packet) => Seen::Packet {
                kind: packet.kind,
                time: packet.time,
            },
            MediaEvent::EndOfStream => Seen::EndOfStream,
        };
        self.seen.lock().unwrap().push(seen);
        true
    }
}

//! Boundary to the codec subsystem
//!
//! Stages only see demuxing, decoding, encoding and packet writing through
//! these traits. All calls are synchronous and made from inside a worker
//! cycle; they may fail, and they should return within a bounded time.

use crate::error::CodecError;
use crate::pipeline::types::{EncodedPacket, MediaKind, MediaSample, MediaTime};
use crate::pool::Pooled;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
}

impl VideoParams {
    pub fn frame_duration(&self) -> MediaTime {
        MediaTime::from_frame_rate(self.frame_rate_num, self.frame_rate_den)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioParams {
    /// Duration of a block of `samples` frames per channel
    pub fn block_duration(&self, samples: u32) -> MediaTime {
        MediaTime::from_samples(samples, self.sample_rate)
    }

    /// Bytes in a block of `samples` frames, all channels interleaved
    pub fn block_size(&self, samples: u32) -> usize {
        samples as usize * self.channels as usize * (self.bits_per_sample as usize / 8)
    }
}

/// What a source offers once opened
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
    /// Unknown for live sources
    pub duration: Option<MediaTime>,
}

impl StreamInfo {
    pub fn has(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video.is_some(),
            MediaKind::Audio => self.audio.is_some(),
        }
    }
}

/// One unit read from a container
#[derive(Debug, Clone)]
pub struct CompressedUnit {
    pub kind: MediaKind,
    pub data: Bytes,
    pub time: MediaTime,
    pub duration: MediaTime,
    pub is_keyframe: bool,
}

#[derive(Debug)]
pub enum ReadOutcome {
    Unit(CompressedUnit),
    /// Nothing usable this time (e.g. a stream the pipeline ignores)
    Skip,
    EndOfStream,
}

pub trait Demuxer: Send {
    fn open(&mut self) -> Result<StreamInfo, CodecError>;

    fn read_next(&mut self) -> Result<ReadOutcome, CodecError>;

    fn close(&mut self);

    /// Network sources are reopened after read failures
    fn is_network(&self) -> bool {
        false
    }
}

/// Decoder for one media kind. Output samples queue inside the decoder
/// until taken.
pub trait Decoder: Send {
    fn kind(&self) -> MediaKind;

    fn initialize(&mut self, info: &StreamInfo) -> Result<(), CodecError>;

    fn decode(&mut self, unit: &CompressedUnit) -> Result<(), CodecError>;

    fn take_sample(&mut self) -> Option<Pooled<MediaSample>>;

    /// Drain delayed output at end of stream
    fn flush(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

pub trait Encoder: Send {
    fn initialize(&mut self) -> Result<(), CodecError>;

    fn deinitialize(&mut self);

    /// Encode one sample, handing finished packets to `emit`. The token is
    /// cancelled when the owning worker is interrupted.
    fn encode(
        &mut self,
        sample: &MediaSample,
        token: &CancellationToken,
        emit: &mut dyn FnMut(EncodedPacket),
    ) -> Result<(), CodecError>;

    /// Emit whatever is still buffered at end of stream
    fn finish(&mut self, _emit: &mut dyn FnMut(EncodedPacket)) -> Result<(), CodecError> {
        Ok(())
    }
}

/// Final destination of encoded packets (muxer, network writer...)
pub trait PacketSink: Send {
    fn open(&mut self) -> Result<(), CodecError>;

    fn write(&mut self, packet: &EncodedPacket) -> Result<(), CodecError>;

    fn close(&mut self);
}

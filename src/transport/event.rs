use crate::error::PoolError;
use crate::pipeline::types::{EncodedPacket, MediaSample};
use crate::pool::Pooled;

/// Message carried between media stages
///
/// End of stream travels through the same channel as the data so listeners
/// see it in order, after the last sample.
#[derive(Debug)]
pub enum MediaEvent {
    Sample(Pooled<MediaSample>),
    Packet(EncodedPacket),
    EndOfStream,
}

impl MediaEvent {
    /// Copy the event for a new owner; samples gain a pool reference.
    pub fn try_clone(&self) -> Result<MediaEvent, PoolError> {
        Ok(match self {
            MediaEvent::Sample(sample) => MediaEvent::Sample(sample.try_clone()?),
            MediaEvent::Packet(packet) => MediaEvent::Packet(packet.clone()),
            MediaEvent::EndOfStream => MediaEvent::EndOfStream,
        })
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, MediaEvent::EndOfStream)
    }
}

//! Media pipeline stages
//!
//! Stages are [`CycleLogic`](crate::workers::CycleLogic) implementations
//! connected through [`Sender`](crate::transport::Sender)s:
//! - Source: demux, decode, pace against the wall clock
//! - Encode: one encoder per media kind, recovers device faults
//! - Sink: writes packets, reopens on repeated failures
//! - Render: hands samples to a callback on the shared scheduler
//! - Transcoder: source, encoders and sink, run to completion
//! - Player: source and render stages, played to the end

pub mod clock;
pub mod encode;
pub mod health;
pub mod pacing;
pub mod player;
pub mod render;
pub mod session;
pub mod sink;
pub mod source;
pub mod transcoder;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use encode::{EncodeInput, EncodeStage};
pub use health::{MetricsSummary, StageMetrics};
pub use pacing::{DrainReport, PacedQueue};
pub use player::Player;
pub use render::{RenderFn, RenderInput, RenderStage, RenderStatus};
pub use session::SessionStatus;
pub use sink::{SinkInput, SinkStage};
pub use source::{SourceStage, SourceStatus};
pub use transcoder::Transcoder;
pub use types::{EncodedPacket, MediaKind, MediaSample, MediaTime, SampleBuffer};

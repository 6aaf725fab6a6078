//! Worker, pooling and transport core of the Castify media pipeline.
//!
//! Stages run as [`Worker`]s, exchange pooled samples through
//! [`Sender`]/[`Listener`] fan-out with backpressure, and pace decoded media
//! against the wall clock before handing it downstream.

pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod transport;
pub mod workers;

pub use config::{EngineConfig, version};
pub use error::{CodecError, PoolError};
pub use pipeline::{MediaKind, MediaSample, MediaTime, Player, SessionStatus, Transcoder};
pub use pool::{Pool, Pooled};
pub use transport::{Listener, MediaEvent, Sender};
pub use workers::{CycleContext, CycleLogic, QuantumScheduler, Worker, WorkerHandle, WorkerState};

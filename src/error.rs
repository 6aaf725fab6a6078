//! Error types shared by the engine
//!
//! Backpressure is never an error: pool exhaustion and rejected posts are
//! reported as `None`/`false`. The types here cover programming errors on
//! pooled handles and the failure kinds surfaced by the codec subsystem.

use thiserror::Error;

/// Errors raised by [`Pool`](crate::pool::Pool) and [`Pooled`](crate::pool::Pooled).
#[derive(Debug, Error)]
pub enum PoolError {
    /// A pool needs room for at least one spare payload.
    #[error("pool capacity must be at least 1")]
    ZeroCapacity,

    /// The payload factory failed. Fatal for the caller.
    #[error("pool allocation failed: {0:#}")]
    Allocation(anyhow::Error),

    /// The handle was already released (double release).
    #[error("pooled item already released by this handle")]
    AlreadyReleased,

    /// The shared reference count would go below zero.
    #[error("pooled item reference count underflow")]
    RefCountUnderflow,

    /// A clone was attempted on an item whose count already reached zero.
    #[error("pooled item used after it was returned")]
    UseAfterFree,
}

/// Failures reported by codec collaborators.
///
/// Device faults are recovered locally by the stage that owns the codec;
/// anything else stops the owning worker.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec device lost")]
    DeviceLost,

    #[error("codec device hung")]
    DeviceHung,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl CodecError {
    /// Whether the fault should be handled by reinitializing the codec.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::DeviceLost | CodecError::DeviceHung)
    }
}

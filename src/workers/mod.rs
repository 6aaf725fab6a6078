//! Worker runtime
//!
//! Every stage runs as a [`Worker`]: a Created/Running/Paused/Stopped state
//! machine whose cycles are driven either by a dedicated thread or by the
//! shared [`QuantumScheduler`].

pub mod scheduler;
pub mod state;
pub mod worker;

pub use scheduler::{QuantumScheduler, Registration};
pub use state::WorkerState;
pub use worker::{CycleContext, CycleLogic, Worker, WorkerHandle};

//! Shared quantum scheduler
//!
//! One background thread ticks every registered callback at a fixed period
//! and runs each on the blocking pool of a tokio runtime, so lightweight
//! workers do not need an OS thread each. A callback still running from the
//! previous tick is skipped rather than queued again.
//!
//! Registrations go through lock-free pending queues drained once per tick,
//! additions before removals.

use crate::config::EngineConfig;
use anyhow::{Context, Result};
use crossbeam_queue::SegQueue;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

const MIN_DELAY: Duration = Duration::from_millis(1);

type Callback = Box<dyn Fn() + Send + Sync>;

struct Entry {
    id: u64,
    callback: Callback,
    /// Set while a dispatched call is in flight
    running: AtomicBool,
    disposing: AtomicBool,
}

/// Clears the reentrancy flag even if the callback panics
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct SchedulerShared {
    runtime: Handle,
    period: Duration,
    calibration_ticks: u32,
    pending_add: SegQueue<Arc<Entry>>,
    pending_remove: SegQueue<u64>,
    next_id: AtomicU64,
    active: AtomicUsize,
    ticks: AtomicU64,
    resolution_micros: AtomicU64,
    shutdown: AtomicBool,
}

impl SchedulerShared {
    fn run(&self) {
        let mut entries: Vec<Arc<Entry>> = Vec::new();
        let mut delay = self.period;
        let mut window_start = Instant::now();
        let mut window_ticks = 0u32;

        while !self.shutdown.load(Ordering::Acquire) {
            for entry in &entries {
                self.dispatch(entry);
            }

            while let Some(entry) = self.pending_add.pop() {
                if !entry.disposing.load(Ordering::Acquire) {
                    entries.push(entry);
                }
            }
            while let Some(id) = self.pending_remove.pop() {
                entries.retain(|entry| entry.id != id);
            }
            self.active.store(entries.len(), Ordering::Release);
            self.ticks.fetch_add(1, Ordering::AcqRel);

            thread::park_timeout(delay);

            window_ticks += 1;
            if window_ticks >= self.calibration_ticks {
                let measured = window_start.elapsed() / window_ticks;
                self.resolution_micros
                    .store(measured.as_micros() as u64, Ordering::Release);
                delay = calibrated_delay(self.period, delay, measured);
                window_start = Instant::now();
                window_ticks = 0;
            }
        }

        for entry in &entries {
            entry.disposing.store(true, Ordering::Release);
        }
        self.active.store(0, Ordering::Release);
    }

    fn dispatch(&self, entry: &Arc<Entry>) {
        if entry.disposing.load(Ordering::Acquire) {
            return;
        }
        if entry
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let entry = Arc::clone(entry);
        self.runtime.spawn_blocking(move || {
            let _guard = RunningGuard(&entry.running);
            if !entry.disposing.load(Ordering::Acquire) {
                (entry.callback)();
            }
        });
    }
}

/// Next sleep so that the average tick converges on `period`.
///
/// `measured` is the observed average tick while sleeping `delay`; the
/// overshoot above `delay` is taken off the nominal period.
pub(crate) fn calibrated_delay(period: Duration, delay: Duration, measured: Duration) -> Duration {
    let overshoot = measured.saturating_sub(delay);
    period.saturating_sub(overshoot).clamp(MIN_DELAY, period.max(MIN_DELAY))
}

/// Background tick shared by lightweight workers
pub struct QuantumScheduler {
    shared: Arc<SchedulerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl QuantumScheduler {
    /// Start the tick thread. Callbacks run on `runtime`'s blocking pool.
    pub fn start(runtime: Handle, config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(SchedulerShared {
            runtime,
            period: config.timing_period(),
            calibration_ticks: config.calibration_ticks,
            pending_add: SegQueue::new(),
            pending_remove: SegQueue::new(),
            next_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
            resolution_micros: AtomicU64::new(config.timing_period().as_micros() as u64),
            shutdown: AtomicBool::new(false),
        });

        let tick = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("quantum-scheduler".into())
            .spawn(move || tick.run())
            .context("failed to spawn scheduler thread")?;

        info!(
            "QuantumScheduler: started with a {:?} period",
            config.timing_period()
        );
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Add a callback to the tick. It starts running from the next tick.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let entry = Arc::new(Entry {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            callback: Box::new(callback),
            running: AtomicBool::new(false),
            disposing: AtomicBool::new(false),
        });
        if self.is_shutdown() {
            debug!("QuantumScheduler: registration {} after shutdown", entry.id);
            entry.disposing.store(true, Ordering::Release);
        } else {
            self.shared.pending_add.push(Arc::clone(&entry));
        }

        Registration {
            entry,
            scheduler: Arc::downgrade(&self.shared),
        }
    }

    /// Average tick length over the last calibration window
    pub fn resolution(&self) -> Duration {
        Duration::from_micros(self.shared.resolution_micros.load(Ordering::Acquire))
    }

    pub fn period(&self) -> Duration {
        self.shared.period
    }

    /// Callbacks currently in the tick list
    pub fn registered(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Ticks completed since start
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop ticking and join the tick thread. In-flight callbacks are not
    /// awaited.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            thread.thread().unpark();
            if thread.join().is_err() {
                log::error!("QuantumScheduler: tick thread panicked");
            }
            debug!("QuantumScheduler: stopped");
        }
    }
}

impl Drop for QuantumScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a registered callback
///
/// Disposing (or dropping) it blocks further calls at once and queues the
/// removal. A call already in flight may still be running afterwards.
pub struct Registration {
    entry: Arc<Entry>,
    scheduler: Weak<SchedulerShared>,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    /// Whether a dispatched call is in flight
    pub fn is_running(&self) -> bool {
        self.entry.running.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.entry.disposing.load(Ordering::Acquire)
    }

    /// Whether the callback can still be ticked
    pub fn is_live(&self) -> bool {
        self.link().is_live()
    }

    pub(crate) fn link(&self) -> TickLink {
        TickLink {
            entry: Arc::downgrade(&self.entry),
            scheduler: Weak::clone(&self.scheduler),
        }
    }

    pub fn dispose(&self) {
        if self.entry.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.scheduler.upgrade() {
            shared.pending_remove.push(self.entry.id);
        }
    }
}

/// Non-owning view of a registration, for whoever waits on its ticks
pub(crate) struct TickLink {
    entry: Weak<Entry>,
    scheduler: Weak<SchedulerShared>,
}

impl TickLink {
    pub(crate) fn is_live(&self) -> bool {
        let registered = self
            .entry
            .upgrade()
            .is_some_and(|entry| !entry.disposing.load(Ordering::Acquire));
        registered
            && self
                .scheduler
                .upgrade()
                .is_some_and(|shared| !shared.shutdown.load(Ordering::Acquire))
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.dispose();
    }
}

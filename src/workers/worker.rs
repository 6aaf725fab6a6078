//! Cooperative worker
//!
//! Control calls never touch the state directly: they queue a request and
//! wait for the cycle runner to acknowledge it. The runner is the only place
//! where `State` changes, once per cycle, before the stage logic runs.

use super::scheduler::{QuantumScheduler, Registration, TickLink};
use super::state::WorkerState;
use crate::config::EngineConfig;
use anyhow::{Context, Result, anyhow};
use crossbeam_channel as channel;
use log::{debug, error, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stage-specific behaviour driven by a [`Worker`]
pub trait CycleLogic: Send + 'static {
    /// Called once, on the first transition to `Running`. An error stops the
    /// worker before any cycle runs.
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Teardown hook, called when the worker is about to become `Stopped`
    fn stop(&mut self) {}

    /// One unit of work. Returns how long the driver should wait before the
    /// next cycle. Any error stops the worker.
    fn execute_cycle(&mut self, ctx: &mut CycleContext) -> Result<Duration>;

    fn on_cycle_error(&mut self, _error: &anyhow::Error) {}

    /// Last call the logic receives, after the worker is stopped for good
    fn on_disposing(&mut self) {}
}

/// Per-cycle view handed to [`CycleLogic::execute_cycle`]
pub struct CycleContext {
    name: Arc<str>,
    token: CancellationToken,
    stop_requested: bool,
}

impl CycleContext {
    pub(crate) fn new(name: Arc<str>, token: CancellationToken) -> Self {
        Self {
            name,
            token,
            stop_requested: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancelled when the worker is interrupted. Advisory: check, don't block.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Ask the runner to stop the worker after this cycle
    pub fn mark_as_stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

struct Request {
    target: WorkerState,
    ack: Option<channel::Sender<WorkerState>>,
}

enum Pending {
    Ready(WorkerState),
    Waiting(channel::Receiver<WorkerState>),
}

struct Runner {
    logic: Box<dyn CycleLogic>,
    desired: WorkerState,
}

struct WorkerCore {
    name: Arc<str>,
    state: AtomicU8,
    requests_tx: channel::Sender<Request>,
    requests_rx: channel::Receiver<Request>,
    token: Mutex<CancellationToken>,
    runner: Mutex<Runner>,
    driver_thread: Mutex<Option<Thread>>,
    /// Set for workers ticked by a shared scheduler
    tick: Mutex<Option<TickLink>>,
    disposing: AtomicBool,
    disposed: AtomicBool,
    period: Duration,
    idle_wait: Duration,
}

impl WorkerCore {
    fn new(name: &str, logic: Box<dyn CycleLogic>, config: &EngineConfig) -> Self {
        let (requests_tx, requests_rx) = channel::unbounded();
        Self {
            name: Arc::from(name),
            state: AtomicU8::new(WorkerState::Created as u8),
            requests_tx,
            requests_rx,
            token: Mutex::new(CancellationToken::new()),
            runner: Mutex::new(Runner {
                logic,
                desired: WorkerState::Created,
            }),
            driver_thread: Mutex::new(None),
            tick: Mutex::new(None),
            disposing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            period: config.timing_period(),
            idle_wait: config.idle_wait(),
        }
    }

    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn runner(&self) -> MutexGuard<'_, Runner> {
        self.runner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_token(&self) -> CancellationToken {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancel the token of the current cycle or wait
    fn interrupt(&self) {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        self.wake();
    }

    /// Fresh token for the next cycle once the previous one was cancelled
    fn renew_token(&self) {
        let mut token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    /// Cut short a dedicated driver's sleep
    fn wake(&self) {
        if let Some(thread) = self
            .driver_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            thread.unpark();
        }
    }

    /// False once the scheduler ticking this worker is gone
    fn is_driven(&self) -> bool {
        self.tick
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(TickLink::is_live)
    }

    fn request(&self, target: WorkerState, allowed: impl Fn(WorkerState) -> bool) -> Pending {
        let current = self.state();
        if self.disposing.load(Ordering::Acquire) || !allowed(current) {
            return Pending::Ready(current);
        }
        if !self.is_driven() {
            warn!("{}: no scheduler left to apply {}", self.name, target);
            return Pending::Ready(current);
        }
        self.send_request(target)
    }

    fn send_request(&self, target: WorkerState) -> Pending {
        let (ack_tx, ack_rx) = channel::bounded(1);
        let request = Request {
            target,
            ack: Some(ack_tx),
        };
        if self.requests_tx.send(request).is_err() {
            return Pending::Ready(self.state());
        }

        if target == WorkerState::Stopped {
            self.interrupt();
        } else {
            self.wake();
        }
        Pending::Waiting(ack_rx)
    }

    /// Block until the runner acknowledges, interrupting on every period
    /// without an answer.
    fn wait(&self, pending: Pending) -> WorkerState {
        let ack = match pending {
            Pending::Ready(state) => return state,
            Pending::Waiting(ack) => ack,
        };

        loop {
            match ack.recv_timeout(self.period) {
                Ok(state) => return state,
                Err(channel::RecvTimeoutError::Timeout) => {
                    let state = self.state();
                    if state == WorkerState::Stopped {
                        return state;
                    }
                    if !self.is_driven() {
                        warn!("{}: scheduler gone while waiting, still {}", self.name, state);
                        return state;
                    }
                    self.interrupt();
                }
                Err(channel::RecvTimeoutError::Disconnected) => return self.state(),
            }
        }
    }

    async fn wait_async(self: &Arc<Self>, pending: Pending) -> WorkerState {
        match pending {
            Pending::Ready(state) => state,
            waiting => {
                let core = Arc::clone(self);
                tokio::task::spawn_blocking(move || core.wait(waiting))
                    .await
                    .unwrap_or_else(|_| self.state())
            }
        }
    }

    /// Apply pending requests. Returns whether the cycle logic should run.
    fn try_begin_cycle(&self, runner: &mut Runner) -> bool {
        let mut acks = Vec::new();
        for request in self.requests_rx.try_iter() {
            // a stop request wins over anything queued after it
            if runner.desired != WorkerState::Stopped {
                runner.desired = request.target;
            }
            acks.extend(request.ack);
        }

        let state = self.state();
        if state == WorkerState::Stopped {
            reply(acks, state);
            return false;
        }

        if state == WorkerState::Created && runner.desired == WorkerState::Running {
            let started = panic::catch_unwind(AssertUnwindSafe(|| runner.logic.start()))
                .unwrap_or_else(|payload| Err(panic_error("start", payload)));
            if let Err(e) = started {
                error!("{}: start failed: {:#}", self.name, e);
                runner.desired = WorkerState::Stopped;
            }
        }

        if runner.desired == WorkerState::Stopped {
            runner.logic.stop();
        }

        let target = runner.desired;
        if target != state {
            self.state.store(target as u8, Ordering::Release);
            debug!("{}: {} -> {}", self.name, state, target);
        }
        reply(acks, target);

        target == WorkerState::Running
    }

    fn execute_cycle(&self, runner: &mut Runner) -> Duration {
        let mut ctx = CycleContext::new(Arc::clone(&self.name), self.current_token());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner.logic.execute_cycle(&mut ctx)))
            .unwrap_or_else(|payload| Err(panic_error("cycle", payload)));

        match outcome {
            Ok(_) if ctx.stop_requested => {
                debug!("{}: stop requested by cycle logic", self.name);
                runner.desired = WorkerState::Stopped;
                Duration::ZERO
            }
            Ok(delay) => delay,
            Err(e) => {
                runner.logic.on_cycle_error(&e);
                error!("{}: cycle failed, stopping: {:#}", self.name, e);
                runner.desired = WorkerState::Stopped;
                Duration::ZERO
            }
        }
    }

    /// One driver step. `None` once the worker is stopped.
    fn cycle(&self) -> Option<Duration> {
        let mut runner = self.runner();
        self.renew_token();

        if !self.try_begin_cycle(&mut runner) {
            return match self.state() {
                WorkerState::Stopped => None,
                _ => Some(self.idle_wait),
            };
        }
        Some(self.execute_cycle(&mut runner))
    }
}

fn reply(acks: Vec<channel::Sender<WorkerState>>, state: WorkerState) {
    for ack in acks {
        let _ = ack.try_send(state);
    }
}

fn panic_error(what: &str, payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    anyhow!("{} panicked: {}", what, message)
}

/// Cloneable control surface of a [`Worker`]
#[derive(Clone)]
pub struct WorkerHandle {
    core: Arc<WorkerCore>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> WorkerState {
        self.core.state()
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::Acquire)
    }

    /// Cancel the token of the cycle in flight
    pub fn interrupt(&self) {
        self.core.interrupt();
    }

    fn start_request(&self) -> Pending {
        self.core.request(WorkerState::Running, |s| {
            !matches!(s, WorkerState::Running | WorkerState::Stopped)
        })
    }

    fn pause_request(&self) -> Pending {
        self.core
            .request(WorkerState::Paused, |s| s == WorkerState::Running)
    }

    fn resume_request(&self) -> Pending {
        self.core.request(WorkerState::Running, |s| {
            !matches!(s, WorkerState::Running | WorkerState::Stopped)
        })
    }

    fn stop_request(&self) -> Pending {
        self.core
            .request(WorkerState::Stopped, |s| s != WorkerState::Stopped)
    }

    /// Request `Running` and wait for the runner to apply it.
    pub async fn start(&self) -> WorkerState {
        let pending = self.start_request();
        self.core.wait_async(pending).await
    }

    /// Request `Paused`; only effective from `Running`.
    pub async fn pause(&self) -> WorkerState {
        let pending = self.pause_request();
        self.core.wait_async(pending).await
    }

    pub async fn resume(&self) -> WorkerState {
        let pending = self.resume_request();
        self.core.wait_async(pending).await
    }

    /// Request `Stopped` and interrupt the cycle in flight.
    pub async fn stop(&self) -> WorkerState {
        let pending = self.stop_request();
        self.core.wait_async(pending).await
    }

    pub fn start_blocking(&self) -> WorkerState {
        self.core.wait(self.start_request())
    }

    pub fn pause_blocking(&self) -> WorkerState {
        self.core.wait(self.pause_request())
    }

    pub fn resume_blocking(&self) -> WorkerState {
        self.core.wait(self.resume_request())
    }

    pub fn stop_blocking(&self) -> WorkerState {
        self.core.wait(self.stop_request())
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

enum Driver {
    Thread(JoinHandle<()>),
    Shared(Registration),
    Detached,
}

/// Owner of a worker and of whatever drives its cycles
///
/// Dereferences to [`WorkerHandle`]. Dropping the worker disposes it.
pub struct Worker {
    handle: WorkerHandle,
    driver: Driver,
}

impl Worker {
    /// Drive `logic` from a dedicated thread that sleeps between cycles for
    /// the delay the last cycle returned.
    pub fn spawn<L: CycleLogic>(name: &str, logic: L, config: &EngineConfig) -> Result<Self> {
        let core = Arc::new(WorkerCore::new(name, Box::new(logic), config));

        let driven = Arc::clone(&core);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || drive(driven))
            .with_context(|| format!("failed to spawn worker thread {}", name))?;
        *core
            .driver_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(thread.thread().clone());

        Ok(Self {
            handle: WorkerHandle { core },
            driver: Driver::Thread(thread),
        })
    }

    /// Drive `logic` from the shared scheduler tick.
    pub fn shared<L: CycleLogic>(
        name: &str,
        logic: L,
        scheduler: &QuantumScheduler,
        config: &EngineConfig,
    ) -> Self {
        let core = Arc::new(WorkerCore::new(name, Box::new(logic), config));

        let weak = Arc::downgrade(&core);
        let registration = scheduler.register(move || {
            if let Some(core) = weak.upgrade() {
                let _ = core.cycle();
            }
        });
        *core.tick.lock().unwrap_or_else(PoisonError::into_inner) = Some(registration.link());

        Self {
            handle: WorkerHandle { core },
            driver: Driver::Shared(registration),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Stop the worker, release its driver and let the logic clean up.
    /// Idempotent.
    pub fn dispose(&mut self) {
        let core = Arc::clone(&self.handle.core);
        if core.disposing.swap(true, Ordering::AcqRel) {
            return;
        }

        if core.state() != WorkerState::Stopped {
            let _ = core.send_request(WorkerState::Stopped);
        }

        match std::mem::replace(&mut self.driver, Driver::Detached) {
            Driver::Thread(thread) => {
                core.wake();
                if thread.join().is_err() {
                    warn!("{}: driver thread panicked", core.name);
                }
            }
            Driver::Shared(registration) => registration.dispose(),
            Driver::Detached => {}
        }

        // finishes the stop if the driver is gone before applying it
        while core.cycle().is_some() {}

        core.runner().logic.on_disposing();
        core.disposed.store(true, Ordering::Release);
        debug!("{}: disposed", core.name);
    }
}

impl std::ops::Deref for Worker {
    type Target = WorkerHandle;

    fn deref(&self) -> &WorkerHandle {
        &self.handle
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn drive(core: Arc<WorkerCore>) {
    debug!("{}: driver started", core.name);
    while let Some(delay) = core.cycle() {
        if !delay.is_zero() {
            thread::park_timeout(delay);
        }
    }
    debug!("{}: driver exited", core.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        stops: AtomicUsize,
        cycles: AtomicUsize,
        disposings: AtomicUsize,
    }

    struct CountingLogic {
        counters: Arc<Counters>,
        fail_start: bool,
        fail_at_cycle: Option<usize>,
        panic_at_cycle: Option<usize>,
        stop_at_cycle: Option<usize>,
        delay: Duration,
    }

    impl CountingLogic {
        fn new(counters: &Arc<Counters>) -> Self {
            Self {
                counters: counters.clone(),
                fail_start: false,
                fail_at_cycle: None,
                panic_at_cycle: None,
                stop_at_cycle: None,
                delay: Duration::from_millis(2),
            }
        }
    }

    impl CycleLogic for CountingLogic {
        fn start(&mut self) -> Result<()> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                anyhow::bail!("device unavailable");
            }
            Ok(())
        }

        fn stop(&mut self) {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn execute_cycle(&mut self, ctx: &mut CycleContext) -> Result<Duration> {
            let cycle = self.counters.cycles.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_at_cycle == Some(cycle) {
                anyhow::bail!("broken pipe");
            }
            if self.panic_at_cycle == Some(cycle) {
                panic!("cycle {} exploded", cycle);
            }
            if self.stop_at_cycle == Some(cycle) {
                ctx.mark_as_stop();
            }
            Ok(self.delay)
        }

        fn on_disposing(&mut self) {
            self.counters.disposings.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> EngineConfig {
        crate::logging::init_for_tests();
        EngineConfig {
            idle_wait_ms: 5,
            ..EngineConfig::default()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_lifecycle_blocking() {
        let counters = Arc::new(Counters::default());
        let worker = Worker::spawn("counting", CountingLogic::new(&counters), &config()).unwrap();
        assert_eq!(worker.state(), WorkerState::Created);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counters.cycles.load(Ordering::SeqCst), 0);

        assert_eq!(worker.start_blocking(), WorkerState::Running);
        assert!(wait_until(|| counters.cycles.load(Ordering::SeqCst) > 2));

        assert_eq!(worker.pause_blocking(), WorkerState::Paused);
        let paused_at = counters.cycles.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counters.cycles.load(Ordering::SeqCst), paused_at);

        assert_eq!(worker.resume_blocking(), WorkerState::Running);
        assert_eq!(worker.stop_blocking(), WorkerState::Stopped);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_requests_return_current_state() {
        let counters = Arc::new(Counters::default());
        let worker = Worker::spawn("counting", CountingLogic::new(&counters), &config()).unwrap();

        assert_eq!(worker.pause_blocking(), WorkerState::Created);
        assert_eq!(worker.start_blocking(), WorkerState::Running);
        assert_eq!(worker.start_blocking(), WorkerState::Running);
        assert_eq!(worker.resume_blocking(), WorkerState::Running);
    }

    #[test]
    fn test_stopped_is_terminal() {
        let counters = Arc::new(Counters::default());
        let worker = Worker::spawn("counting", CountingLogic::new(&counters), &config()).unwrap();
        assert_eq!(worker.stop_blocking(), WorkerState::Stopped);

        assert_eq!(worker.start_blocking(), WorkerState::Stopped);
        assert_eq!(worker.resume_blocking(), WorkerState::Stopped);
        assert_eq!(worker.pause_blocking(), WorkerState::Stopped);
        assert_eq!(worker.stop_blocking(), WorkerState::Stopped);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 0);
        assert_eq!(counters.cycles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_start_stops_worker() {
        let counters = Arc::new(Counters::default());
        let mut logic = CountingLogic::new(&counters);
        logic.fail_start = true;
        let worker = Worker::spawn("counting", logic, &config()).unwrap();

        assert_eq!(worker.start_blocking(), WorkerState::Stopped);
        assert_eq!(counters.cycles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cycle_error_stops_worker() {
        let counters = Arc::new(Counters::default());
        let mut logic = CountingLogic::new(&counters);
        logic.fail_at_cycle = Some(3);
        let worker = Worker::spawn("counting", logic, &config()).unwrap();

        worker.start_blocking();
        assert!(wait_until(|| worker.state() == WorkerState::Stopped));
        assert_eq!(counters.cycles.load(Ordering::SeqCst), 3);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cycle_panic_stops_worker() {
        let counters = Arc::new(Counters::default());
        let mut logic = CountingLogic::new(&counters);
        logic.panic_at_cycle = Some(2);
        let worker = Worker::spawn("counting", logic, &config()).unwrap();

        worker.start_blocking();
        assert!(wait_until(|| worker.state() == WorkerState::Stopped));
        assert_eq!(counters.cycles.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_mark_as_stop() {
        let counters = Arc::new(Counters::default());
        let mut logic = CountingLogic::new(&counters);
        logic.stop_at_cycle = Some(4);
        let worker = Worker::spawn("counting", logic, &config()).unwrap();

        worker.start_blocking();
        assert!(wait_until(|| worker.state() == WorkerState::Stopped));
        assert_eq!(counters.cycles.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_stop_interrupts_long_sleep() {
        let counters = Arc::new(Counters::default());
        let mut logic = CountingLogic::new(&counters);
        logic.delay = Duration::from_secs(30);
        let worker = Worker::spawn("counting", logic, &config()).unwrap();
        worker.start_blocking();
        assert!(wait_until(|| counters.cycles.load(Ordering::SeqCst) == 1));

        let begin = Instant::now();
        assert_eq!(worker.stop_blocking(), WorkerState::Stopped);
        assert!(begin.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_concurrent_stops_both_observe_stopped() {
        let counters = Arc::new(Counters::default());
        let worker = Worker::spawn("counting", CountingLogic::new(&counters), &config()).unwrap();
        worker.start_blocking();

        let callers: Vec<_> = (0..2)
            .map(|_| {
                let handle = worker.handle();
                thread::spawn(move || {
                    let begin = Instant::now();
                    (handle.stop_blocking(), begin.elapsed())
                })
            })
            .collect();

        for caller in callers {
            let (state, elapsed) = caller.join().unwrap();
            assert_eq!(state, WorkerState::Stopped);
            assert!(elapsed < Duration::from_millis(200));
        }
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_stops_and_notifies_logic() {
        let counters = Arc::new(Counters::default());
        let mut worker = Worker::spawn("counting", CountingLogic::new(&counters), &config()).unwrap();
        worker.start_blocking();
        let handle = worker.handle();

        worker.dispose();
        assert!(handle.is_disposed());
        assert_eq!(handle.state(), WorkerState::Stopped);
        assert_eq!(counters.disposings.load(Ordering::SeqCst), 1);

        worker.dispose();
        drop(worker);
        assert_eq!(counters.disposings.load(Ordering::SeqCst), 1);
        assert_eq!(handle.start_blocking(), WorkerState::Stopped);
    }

    #[test]
    fn test_dispose_never_started_worker() {
        let counters = Arc::new(Counters::default());
        let worker = Worker::spawn("counting", CountingLogic::new(&counters), &config()).unwrap();
        let handle = worker.handle();
        drop(worker);

        assert_eq!(handle.state(), WorkerState::Stopped);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 0);
        assert_eq!(counters.disposings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_control_calls() {
        let counters = Arc::new(Counters::default());
        let worker = Worker::spawn("counting", CountingLogic::new(&counters), &config()).unwrap();

        assert_eq!(worker.start().await, WorkerState::Running);
        assert_eq!(worker.pause().await, WorkerState::Paused);
        assert_eq!(worker.resume().await, WorkerState::Running);

        let (a, b) = tokio::join!(worker.stop(), worker.stop());
        assert_eq!(a, WorkerState::Stopped);
        assert_eq!(b, WorkerState::Stopped);
    }

    #[test]
    fn test_shared_worker_without_scheduler_does_not_block() {
        let config = config();
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let scheduler = QuantumScheduler::start(rt.handle().clone(), &config).unwrap();
        scheduler.shutdown();

        let counters = Arc::new(Counters::default());
        let worker = Worker::shared("orphan", CountingLogic::new(&counters), &scheduler, &config);
        let begin = Instant::now();
        assert_eq!(worker.start_blocking(), WorkerState::Created);
        assert!(begin.elapsed() < Duration::from_millis(500));
        assert_eq!(counters.cycles.load(Ordering::SeqCst), 0);

        drop(worker);
        assert_eq!(counters.disposings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_requests_after_scheduler_shutdown_return() {
        let config = EngineConfig {
            timing_period_ms: 5,
            ..config()
        };
        let scheduler =
            QuantumScheduler::start(tokio::runtime::Handle::current(), &config).unwrap();
        let counters = Arc::new(Counters::default());
        let worker = Worker::shared("light", CountingLogic::new(&counters), &scheduler, &config);
        assert_eq!(worker.start().await, WorkerState::Running);

        scheduler.shutdown();
        let paused = tokio::time::timeout(Duration::from_secs(1), worker.pause()).await;
        assert_eq!(paused.unwrap(), WorkerState::Running);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shared_worker_runs_on_scheduler() {
        let config = EngineConfig {
            timing_period_ms: 5,
            ..config()
        };
        let scheduler =
            QuantumScheduler::start(tokio::runtime::Handle::current(), &config).unwrap();
        let counters = Arc::new(Counters::default());
        let worker = Worker::shared("light", CountingLogic::new(&counters), &scheduler, &config);

        assert_eq!(worker.start().await, WorkerState::Running);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(counters.cycles.load(Ordering::SeqCst) >= 3);

        assert_eq!(worker.stop().await, WorkerState::Stopped);
        let stopped_at = counters.cycles.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.cycles.load(Ordering::SeqCst), stopped_at);

        drop(worker);
        assert_eq!(counters.disposings.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }
}

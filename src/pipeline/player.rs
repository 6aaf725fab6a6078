//! Playback session
//!
//! A source on its own worker thread feeds one render stage per decoded kind.
//! Render stages are light and run on the shared scheduler tick. The session
//! completes once every render stage rendered up to its end of stream.

use anyhow::{Result, bail, ensure};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::render::{RenderStage, RenderStatus};
use super::session::{SessionStatus, settle_stopped, wait_terminal};
use super::source::{SourceStage, SourceStatus};
use super::types::{MediaKind, MediaTime};
use crate::config::EngineConfig;
use crate::workers::{
    CycleContext, CycleLogic, QuantumScheduler, Worker, WorkerHandle, WorkerState,
};

struct Playback {
    source: WorkerHandle,
    source_status: Arc<SourceStatus>,
    renders: Vec<(WorkerHandle, Arc<RenderStatus>)>,
    status: watch::Sender<SessionStatus>,
    period: Duration,
}

impl Playback {
    fn is_completed(&self) -> bool {
        self.renders.iter().all(|(_, status)| status.is_completed())
    }

    fn unexpected_stop(&self) -> Option<String> {
        for (handle, status) in &self.renders {
            if handle.state().is_stopped() && !status.is_completed() {
                return Some(format!("{} stopped before end of stream", handle.name()));
            }
        }
        if self.source.state().is_stopped() && !self.source_status.reached_end() {
            return Some(format!("{} stopped before end of stream", self.source.name()));
        }
        None
    }
}

impl CycleLogic for Playback {
    fn start(&mut self) -> Result<()> {
        let mut order: Vec<WorkerHandle> =
            self.renders.iter().map(|(handle, _)| handle.clone()).collect();
        order.push(self.source.clone());

        for handle in order {
            let state = handle.start_blocking();
            if state != WorkerState::Running {
                let reason = format!("{} did not start ({})", handle.name(), state);
                self.status.send_replace(SessionStatus::Failed(reason.clone()));
                bail!(reason);
            }
        }

        self.status.send_replace(SessionStatus::Running);
        info!("Player: playing {} streams", self.renders.len());
        Ok(())
    }

    fn stop(&mut self) {
        self.source.stop_blocking();
        for (handle, _) in &self.renders {
            handle.stop_blocking();
        }
        settle_stopped(&self.status);
    }

    fn execute_cycle(&mut self, ctx: &mut CycleContext) -> Result<Duration> {
        if self.is_completed() {
            info!("Player: completed");
            self.status.send_replace(SessionStatus::Completed);
            ctx.mark_as_stop();
            return Ok(Duration::ZERO);
        }

        if let Some(reason) = self.unexpected_stop() {
            error!("Player: {}", reason);
            self.status.send_replace(SessionStatus::Failed(reason));
            ctx.mark_as_stop();
            return Ok(Duration::ZERO);
        }

        Ok(self.period)
    }
}

/// Source → render callbacks, played to the end
pub struct Player {
    // dropped first: its stop hook stops the children
    session: Worker,
    children: Vec<Worker>,
    renders: Vec<(MediaKind, Arc<RenderStatus>)>,
    status: watch::Receiver<SessionStatus>,
}

impl Player {
    /// Render stages run on `scheduler`, which should outlive the player.
    pub fn new(
        source: SourceStage,
        renders: Vec<RenderStage>,
        scheduler: &QuantumScheduler,
        config: &EngineConfig,
    ) -> Result<Self> {
        ensure!(!renders.is_empty(), "a player needs at least one render stage");
        for kind in source.kinds() {
            ensure!(
                renders.iter().any(|render| render.kind() == kind),
                "no render stage for {} samples",
                kind
            );
        }

        let output = source.output();
        let source_status = source.status();

        let mut children = Vec::with_capacity(renders.len() + 1);
        let mut render_handles = Vec::with_capacity(renders.len());
        let mut render_status = Vec::with_capacity(renders.len());
        for render in renders {
            output.connect_to(render.input());
            let status = render.status();
            let kind = render.kind();

            let worker = Worker::shared(&format!("render-{}", kind), render, scheduler, config);
            render_handles.push((worker.handle(), status.clone()));
            render_status.push((kind, status));
            children.push(worker);
        }

        let source = Worker::spawn("source", source, config)?;

        let (status_tx, status) = watch::channel(SessionStatus::Idle);
        let playback = Playback {
            source: source.handle(),
            source_status,
            renders: render_handles,
            status: status_tx,
            period: config.timing_period(),
        };
        let session = Worker::spawn("player", playback, config)?;

        children.insert(0, source);
        Ok(Self {
            session,
            children,
            renders: render_status,
            status,
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.session.handle()
    }

    pub fn state(&self) -> WorkerState {
        self.session.state()
    }

    pub async fn start(&self) -> WorkerState {
        self.session.start().await
    }

    pub async fn stop(&self) -> WorkerState {
        self.session.stop().await
    }

    pub fn start_blocking(&self) -> WorkerState {
        self.session.start_blocking()
    }

    pub fn stop_blocking(&self) -> WorkerState {
        self.session.stop_blocking()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Resolves once playback completed, stopped or failed
    pub async fn wait_completed(&self) -> SessionStatus {
        wait_terminal(self.status.clone()).await
    }

    /// End of the last sample rendered for `kind`
    pub fn position(&self, kind: MediaKind) -> Option<MediaTime> {
        self.renders
            .iter()
            .find(|(render_kind, _)| *render_kind == kind)
            .map(|(_, status)| status.position())
    }

    pub fn child_states(&self) -> Vec<(String, WorkerState)> {
        self.children
            .iter()
            .map(|child| (child.name().to_string(), child.state()))
            .collect()
    }
}

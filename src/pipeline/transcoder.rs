//! Transcoding session
//!
//! Wires a source, one encoder per media kind and a sink, each on its own
//! worker thread. The session itself is a worker too: its start hook starts
//! the children downstream first, its cycles watch for completion, and its
//! stop hook stops the children upstream first. Progress is published on a
//! `watch` channel.

use anyhow::{Result, bail, ensure};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::encode::{EncodeInput, EncodeStage};
use super::session::{SessionStatus, settle_stopped, wait_terminal};
use super::sink::{SinkInput, SinkStage};
use super::source::{SourceStage, SourceStatus};
use crate::config::EngineConfig;
use crate::workers::{CycleContext, CycleLogic, Worker, WorkerHandle, WorkerState};

struct Session {
    source: WorkerHandle,
    source_status: Arc<SourceStatus>,
    encoders: Vec<(WorkerHandle, Arc<EncodeInput>)>,
    sink: WorkerHandle,
    sink_input: Arc<SinkInput>,
    status: watch::Sender<SessionStatus>,
    period: Duration,
}

impl Session {
    fn is_completed(&self) -> bool {
        self.sink_input.is_finished() && !self.encoders.iter().any(|(_, input)| input.is_encoding())
    }

    /// A child that stopped without finishing its part
    fn unexpected_stop(&self) -> Option<String> {
        if self.sink.state().is_stopped() && !self.sink_input.is_finished() {
            return Some(format!("{} stopped before every stream ended", self.sink.name()));
        }
        for (handle, input) in &self.encoders {
            if handle.state().is_stopped() && !input.is_finished() {
                return Some(format!("{} stopped before end of stream", handle.name()));
            }
        }
        if self.source.state().is_stopped() && !self.source_status.reached_end() {
            return Some(format!("{} stopped before end of stream", self.source.name()));
        }
        None
    }
}

impl CycleLogic for Session {
    fn start(&mut self) -> Result<()> {
        let mut order = vec![self.sink.clone()];
        order.extend(self.encoders.iter().map(|(handle, _)| handle.clone()));
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
        info!("Transcoder: running with {} encoders", self.encoders.len());
        Ok(())
    }

    fn stop(&mut self) {
        self.source.stop_blocking();
        for (handle, _) in &self.encoders {
            handle.stop_blocking();
        }
        self.sink.stop_blocking();

        settle_stopped(&self.status);
    }

    fn execute_cycle(&mut self, ctx: &mut CycleContext) -> Result<Duration> {
        if self.is_completed() {
            info!("Transcoder: completed");
            self.status.send_replace(SessionStatus::Completed);
            ctx.mark_as_stop();
            return Ok(Duration::ZERO);
        }

        if let Some(reason) = self.unexpected_stop() {
            error!("Transcoder: {}", reason);
            self.status.send_replace(SessionStatus::Failed(reason));
            ctx.mark_as_stop();
            return Ok(Duration::ZERO);
        }

        Ok(self.period)
    }
}

/// Source → encoders → sink, run to completion
pub struct Transcoder {
    // dropped first: its stop hook stops the children
    session: Worker,
    children: Vec<Worker>,
    status: watch::Receiver<SessionStatus>,
}

impl Transcoder {
    pub fn new(
        source: SourceStage,
        encoders: Vec<EncodeStage>,
        sink: SinkStage,
        config: &EngineConfig,
    ) -> Result<Self> {
        ensure!(!encoders.is_empty(), "a transcoder needs at least one encoder");
        for kind in source.kinds() {
            ensure!(
                encoders.iter().any(|encoder| encoder.kind() == kind),
                "no encoder for {} samples",
                kind
            );
        }

        let output = source.output();
        let source_status = source.status();
        let sink_input = sink.input();
        sink_input.set_expected_streams(encoders.len());

        let mut children = Vec::with_capacity(encoders.len() + 2);
        let mut encoder_handles = Vec::with_capacity(encoders.len());
        for encoder in encoders {
            let input = encoder.input();
            output.connect_to(input.clone());
            encoder.output().connect_to(sink_input.clone());

            let name = format!("encoder-{}", encoder.kind());
            let worker = Worker::spawn(&name, encoder, config)?;
            encoder_handles.push((worker.handle(), input));
            children.push(worker);
        }

        let sink = Worker::spawn("sink", sink, config)?;
        let source = Worker::spawn("source", source, config)?;

        let (status_tx, status) = watch::channel(SessionStatus::Idle);
        let session = Session {
            source: source.handle(),
            source_status,
            encoders: encoder_handles,
            sink: sink.handle(),
            sink_input,
            status: status_tx,
            period: config.timing_period(),
        };
        let session = Worker::spawn("transcoder", session, config)?;

        children.insert(0, source);
        children.push(sink);
        Ok(Self {
            session,
            children,
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

    /// Resolves once the session completed, stopped or failed
    pub async fn wait_completed(&self) -> SessionStatus {
        wait_terminal(self.status.clone()).await
    }

    pub fn child_states(&self) -> Vec<(String, WorkerState)> {
        self.children
            .iter()
            .map(|child| (child.name().to_string(), child.state()))
            .collect()
    }
}

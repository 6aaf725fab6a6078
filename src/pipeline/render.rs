//! Render stage: hands decoded samples of one kind to a callback
//!
//! Light enough to run on the shared scheduler tick. Every tick renders what
//! the inbox holds and advances the playback position.

use anyhow::Result;
use log::info;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use super::health::StageMetrics;
use super::types::{MediaKind, MediaSample, MediaTime};
use crate::config::EngineConfig;
use crate::pool::Pooled;
use crate::transport::{Inbox, Listener, MediaEvent};
use crate::workers::{CycleContext, CycleLogic};

pub type RenderFn = Box<dyn FnMut(&MediaSample) + Send>;

pub struct RenderInput {
    kind: MediaKind,
    inbox: Inbox<Pooled<MediaSample>>,
    end_of_stream: AtomicBool,
    metrics: Arc<StageMetrics>,
}

impl Listener<MediaEvent> for RenderInput {
    fn queue_event(&self, event: &MediaEvent) -> bool {
        match event {
            MediaEvent::Sample(sample) if sample.kind() == self.kind => {
                let Ok(copy) = sample.try_clone() else {
                    return false;
                };
                if self.inbox.try_push(copy).is_err() {
                    self.metrics.record_rejected();
                    return false;
                }
                true
            }
            MediaEvent::EndOfStream => {
                self.end_of_stream.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct RenderStatus {
    position: AtomicI64,
    completed: AtomicBool,
}

impl RenderStatus {
    /// End of the last rendered sample
    pub fn position(&self) -> MediaTime {
        MediaTime::from_ticks(self.position.load(Ordering::Acquire))
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

pub struct RenderStage {
    input: Arc<RenderInput>,
    status: Arc<RenderStatus>,
    render: RenderFn,
    metrics: Arc<StageMetrics>,
    period: Duration,
}

impl RenderStage {
    pub fn new(kind: MediaKind, render: RenderFn, config: &EngineConfig) -> Self {
        let metrics = Arc::new(StageMetrics::new());
        Self {
            input: Arc::new(RenderInput {
                kind,
                inbox: Inbox::new(config.cache_count(kind)),
                end_of_stream: AtomicBool::new(false),
                metrics: metrics.clone(),
            }),
            status: Arc::new(RenderStatus::default()),
            render,
            metrics,
            period: config.timing_period(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.input.kind
    }

    pub fn input(&self) -> Arc<RenderInput> {
        self.input.clone()
    }

    pub fn status(&self) -> Arc<RenderStatus> {
        self.status.clone()
    }

    pub fn metrics(&self) -> Arc<StageMetrics> {
        self.metrics.clone()
    }
}

impl CycleLogic for RenderStage {
    fn execute_cycle(&mut self, ctx: &mut CycleContext) -> Result<Duration> {
        // read before draining: anything queued ahead of the end is rendered
        let ended = self.input.end_of_stream.load(Ordering::Acquire);
        while let Some(sample) = self.input.inbox.pop() {
            (self.render)(&sample);
            let end = sample.time() + sample.duration();
            self.status.position.store(end.ticks(), Ordering::Release);
            self.metrics.record_posted();
        }

        if ended {
            self.status.completed.store(true, Ordering::Release);
            info!(
                "RenderStage: {} playback complete at {}",
                self.input.kind,
                self.status.position()
            );
            ctx.mark_as_stop();
        }
        Ok(self.period)
    }

    fn on_disposing(&mut self) {
        self.input.inbox.clear();
    }
}

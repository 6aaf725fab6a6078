//! Real-time pacing of decoded samples
//!
//! Decoders produce output in bursts. A [`PacedQueue`] holds one kind of
//! decoded samples and hands them downstream either against the wall clock or
//! as fast as listeners accept them, restamping each sample with its slot on a
//! continuous timeline. A rejected post leaves the sample at the head of the
//! queue; nothing is skipped or dropped.

use std::collections::VecDeque;

use super::types::{MediaKind, MediaSample, MediaTime};
use crate::pool::Pooled;
use crate::transport::MediaEvent;

/// Result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub posted: usize,
    /// A listener refused the head sample; the pass stopped there
    pub rejected: bool,
}

pub struct PacedQueue {
    kind: MediaKind,
    samples: VecDeque<Pooled<MediaSample>>,
    next_time: MediaTime,
    nominal: MediaTime,
    ceiling: usize,
}

impl PacedQueue {
    /// `nominal` is the slot length of every sample; zero keeps each sample's
    /// own duration.
    pub fn new(kind: MediaKind, nominal: MediaTime, ceiling: usize) -> Self {
        Self {
            kind,
            samples: VecDeque::with_capacity(ceiling),
            next_time: MediaTime::ZERO,
            nominal,
            ceiling,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn push(&mut self, sample: Pooled<MediaSample>) {
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// At or above the ceiling: the owner should stop reading input
    pub fn is_saturated(&self) -> bool {
        self.samples.len() >= self.ceiling
    }

    /// Scheduled time of the next sample to post
    pub fn next_time(&self) -> MediaTime {
        self.next_time
    }

    pub fn nominal_duration(&self) -> MediaTime {
        self.nominal
    }

    /// Rewind the timeline and release everything queued
    pub fn reset(&mut self) {
        self.samples.clear();
        self.next_time = MediaTime::ZERO;
    }

    fn slot_of(&self, sample: &MediaSample) -> MediaTime {
        if self.nominal.is_positive() {
            self.nominal
        } else {
            sample.duration()
        }
    }

    /// Post every sample whose slot has fully elapsed by `elapsed`.
    ///
    /// A sample is due once the wall clock has passed the end of its slot, so
    /// after `k` slots plus any fraction exactly `k` samples are out.
    pub fn drain_real_time(
        &mut self,
        elapsed: MediaTime,
        post: &mut dyn FnMut(&MediaEvent) -> bool,
    ) -> DrainReport {
        let mut report = DrainReport::default();
        while let Some(head) = self.samples.front() {
            if elapsed <= self.next_time + self.slot_of(head) {
                break;
            }
            if !self.post_head(post) {
                report.rejected = true;
                break;
            }
            report.posted += 1;
        }
        report
    }

    /// Post until the queue is empty or a post is rejected
    pub fn drain_all(&mut self, post: &mut dyn FnMut(&MediaEvent) -> bool) -> DrainReport {
        let mut report = DrainReport::default();
        while !self.samples.is_empty() {
            if !self.post_head(post) {
                report.rejected = true;
                break;
            }
            report.posted += 1;
        }
        report
    }

    fn post_head(&mut self, post: &mut dyn FnMut(&MediaEvent) -> bool) -> bool {
        let Some(sample) = self.samples.pop_front() else {
            return false;
        };
        let slot = self.slot_of(&sample);
        sample.set_time(self.next_time);
        sample.set_duration(slot);

        let event = MediaEvent::Sample(sample);
        if !post(&event) {
            if let MediaEvent::Sample(sample) = event {
                self.samples.push_front(sample);
            }
            return false;
        }

        self.next_time += slot;
        // dropping the event releases the queue's reference
        true
    }
}

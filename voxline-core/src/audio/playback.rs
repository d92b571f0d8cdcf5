//! Gapless playback of streamed assistant audio.
//!
//! ## Scheduling
//!
//! One cursor, `next_start`, on the output device's own clock:
//!
//! ```text
//! start      = max(device_now, next_start)
//! next_start = start + duration
//! ```
//!
//! Chunks therefore play in arrival order, never overlap, queue back-to-back
//! when they arrive faster than real time, and start immediately (rather
//! than in the past) after a network stall. The input device's clock is never
//! consulted.
//!
//! ## Speaking
//!
//! Speaking is true from the first scheduled chunk until `TurnComplete`, or
//! until the device clock reaches `next_start` within the drain tolerance.
//!
//! ## Barge-in
//!
//! `interrupt` pulls the cursor back to the device clock, flushes whatever
//! the device still has queued and clears speaking.
//!
//! ## Rates
//!
//! The device is opened for one chunk rate. A chunk arriving at any other
//! rate is converted first, so its duration on the clock matches what plays.

use tracing::{debug, warn};

use crate::audio::device::OutputDevice;
use crate::audio::resample;
use crate::buffering::PlaybackChunk;

/// Pure cursor arithmetic, independent of any device.
#[derive(Debug, Clone)]
pub struct PlaybackScheduler {
    next_start: Option<f64>,
    speaking: bool,
    drain_tolerance: f64,
}

impl PlaybackScheduler {
    /// `drain_tolerance` in seconds.
    pub fn new(drain_tolerance: f64) -> Self {
        Self {
            next_start: None,
            speaking: false,
            drain_tolerance: drain_tolerance.max(0.0),
        }
    }

    /// Reserve a window of `duration` seconds; returns its start time.
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        let cursor = *self.next_start.get_or_insert(now);
        let start = now.max(cursor);
        self.next_start = Some(start + duration.max(0.0));
        self.speaking = true;
        start
    }

    /// Abandon the backlog.
    pub fn interrupt(&mut self, now: f64) {
        self.next_start = Some(now);
        self.speaking = false;
    }

    pub fn turn_complete(&mut self) {
        self.speaking = false;
    }

    /// Clear speaking once the device clock has caught up with the cursor.
    /// Returns `true` if speaking changed.
    pub fn poll(&mut self, now: f64) -> bool {
        if !self.speaking {
            return false;
        }
        match self.next_start {
            Some(cursor) if now + self.drain_tolerance >= cursor => {
                self.speaking = false;
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.next_start = None;
        self.speaking = false;
    }

    pub fn next_start(&self) -> Option<f64> {
        self.next_start
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Seconds of audio queued ahead of `now`.
    pub fn backlog(&self, now: f64) -> f64 {
        self.next_start.map_or(0.0, |c| (c - now).max(0.0))
    }
}

/// The scheduler bound to the device it schedules on.
pub struct Playback {
    device: Box<dyn OutputDevice>,
    sample_rate: u32,
    scheduler: PlaybackScheduler,
    closed: bool,
}

impl Playback {
    /// `sample_rate` is the chunk rate the device was opened for.
    pub fn new(device: Box<dyn OutputDevice>, sample_rate: u32, drain_tolerance: f64) -> Self {
        Self {
            device,
            sample_rate,
            scheduler: PlaybackScheduler::new(drain_tolerance),
            closed: false,
        }
    }

    /// Schedule one chunk at the next free slot; returns its start time, or
    /// `None` if the chunk could not be brought to the device's rate.
    pub fn enqueue(&mut self, chunk: &PlaybackChunk) -> Option<f64> {
        if chunk.sample_rate != self.sample_rate {
            warn!(
                seq = chunk.seq,
                from = chunk.sample_rate,
                to = self.sample_rate,
                "chunk rate differs from output rate; converting"
            );
            let samples = match resample::convert(&chunk.samples, chunk.sample_rate, self.sample_rate) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(seq = chunk.seq, "chunk dropped: {e}");
                    return None;
                }
            };
            let conformed = PlaybackChunk {
                seq: chunk.seq,
                samples,
                sample_rate: self.sample_rate,
            };
            return Some(self.schedule(&conformed));
        }
        Some(self.schedule(chunk))
    }

    fn schedule(&mut self, chunk: &PlaybackChunk) -> f64 {
        let now = self.device.now();
        let start = self.scheduler.schedule(now, chunk.duration_secs());
        debug!(
            seq = chunk.seq,
            start,
            now,
            duration = chunk.duration_secs(),
            "chunk scheduled"
        );
        self.device.schedule(start, chunk);
        start
    }

    pub fn interrupt(&mut self) {
        let now = self.device.now();
        debug!(now, backlog = self.scheduler.backlog(now), "playback interrupted");
        self.device.flush();
        self.scheduler.interrupt(now);
    }

    /// End of the assistant's turn: the device plays out anything it held
    /// back and speaking clears.
    pub fn turn_complete(&mut self) {
        self.device.end_of_stream();
        self.scheduler.turn_complete();
    }

    /// See [`PlaybackScheduler::poll`].
    pub fn poll(&mut self) -> bool {
        let now = self.device.now();
        self.scheduler.poll(now)
    }

    pub fn is_speaking(&self) -> bool {
        self.scheduler.is_speaking()
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn now(&self) -> f64 {
        self.device.now()
    }

    /// Stop output and release the device. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.device.flush();
        self.device.close();
        self.scheduler.reset();
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.close();
    }
}

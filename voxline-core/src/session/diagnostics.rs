//! Per-session counters, readable at any time without locking.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub frames_produced: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub chunks_scheduled: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub tool_calls_dispatched: AtomicUsize,
    pub tool_calls_failed: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.frames_produced.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.chunks_scheduled.store(0, Ordering::Relaxed);
        self.interruptions.store(0, Ordering::Relaxed);
        self.tool_calls_dispatched.store(0, Ordering::Relaxed);
        self.tool_calls_failed.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_produced: self.frames_produced.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            tool_calls_dispatched: self.tool_calls_dispatched.load(Ordering::Relaxed),
            tool_calls_failed: self.tool_calls_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub frames_produced: usize,
    pub frames_sent: usize,
    pub frames_dropped: usize,
    pub chunks_scheduled: usize,
    pub interruptions: usize,
    pub tool_calls_dispatched: usize,
    pub tool_calls_failed: usize,
}

impl DiagnosticsSnapshot {
    /// Every produced frame was either sent or explicitly dropped.
    pub fn frames_accounted(&self) -> bool {
        self.frames_sent + self.frames_dropped == self.frames_produced
    }
}

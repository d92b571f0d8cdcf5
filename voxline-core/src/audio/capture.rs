//! Microphone side of the session: fixed-size frames, volume metering and
//! ordered forwarding to the transport.
//!
//! ## Per block
//!
//! ```text
//! drain thread ─► push(samples) ─► pending buffer
//!                                     │  every `frame_samples`
//!                                     ▼
//!                     CaptureFrame { seq, samples, volume }
//!                                     │ codec::encode_frame
//!                                     ▼
//!                    TransportLink::send (never waits)
//! ```
//!
//! Frames are numbered in capture order and sent in that order. A frame the
//! transport cannot take right now is dropped, logged and counted; nothing is
//! ever reordered or sent twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::audio::device::SampleSink;
use crate::buffering::CaptureFrame;
use crate::codec;
use crate::ipc::events::AudioActivityEvent;
use crate::ipc::signals::SessionSignals;
use crate::session::diagnostics::SessionDiagnostics;
use crate::transport::{SendOutcome, TransportLink};

/// Root-mean-square of a sample slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Scale an RMS level for UI metering, clamped to [0.0, 1.0].
pub fn volume_from_rms(rms: f32, gain: f32) -> f32 {
    let v = rms * gain;
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Everything the pipeline shares with the session.
#[derive(Clone)]
pub struct CaptureContext {
    /// Samples per frame (4096 at 16 kHz ≈ 256 ms).
    pub frame_samples: usize,
    pub sample_rate: u32,
    pub volume_gain: f32,
    /// Filled once the transport is connected.
    pub outlet: Arc<OnceLock<TransportLink>>,
    pub signals: Arc<SessionSignals>,
    pub activity_tx: broadcast::Sender<AudioActivityEvent>,
    pub activity_seq: Arc<AtomicU64>,
    pub diagnostics: Arc<SessionDiagnostics>,
}

pub struct CapturePipeline {
    ctx: CaptureContext,
    pending: Vec<f32>,
    next_seq: u64,
}

impl CapturePipeline {
    pub fn new(ctx: CaptureContext) -> Self {
        let frame_samples = ctx.frame_samples.max(1);
        Self {
            ctx: CaptureContext {
                frame_samples,
                ..ctx
            },
            pending: Vec::with_capacity(frame_samples * 2),
            next_seq: 0,
        }
    }

    /// Accept one block of mono samples at `sample_rate`.
    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.ctx.frame_samples {
            let block: Vec<f32> = self.pending.drain(..self.ctx.frame_samples).collect();
            let frame = self.assemble(block);
            self.forward(frame);
        }
    }

    /// Wrap the pipeline as a device sink.
    pub fn into_sink(mut self) -> SampleSink {
        Box::new(move |samples: &[f32]| self.push(samples))
    }

    fn assemble(&mut self, samples: Vec<f32>) -> CaptureFrame {
        let seq = self.next_seq;
        self.next_seq += 1;
        let volume = volume_from_rms(rms(&samples), self.ctx.volume_gain);
        CaptureFrame {
            seq,
            samples,
            sample_rate: self.ctx.sample_rate,
            volume,
        }
    }

    fn forward(&self, frame: CaptureFrame) {
        let ctx = &self.ctx;
        ctx.diagnostics
            .frames_produced
            .fetch_add(1, Ordering::Relaxed);

        ctx.signals.set_volume(frame.volume);
        let _ = ctx.activity_tx.send(AudioActivityEvent {
            seq: ctx.activity_seq.fetch_add(1, Ordering::Relaxed),
            volume: frame.volume,
            is_speaking: ctx.signals.is_speaking(),
        });

        let encoded = codec::encode_frame(&frame);
        let Some(link) = ctx.outlet.get() else {
            warn!(seq = frame.seq, "capture frame dropped: transport not connected");
            ctx.diagnostics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match link.send(encoded) {
            SendOutcome::Queued => {
                ctx.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            SendOutcome::Dropped => {
                warn!(seq = frame.seq, "capture frame dropped: outbound queue full");
                ctx.diagnostics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            SendOutcome::Closed => {
                debug!(seq = frame.seq, "capture frame discarded: transport closed");
                ctx.diagnostics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::open_link;
    use approx::assert_relative_eq;

    fn context(outlet: Arc<OnceLock<TransportLink>>) -> CaptureContext {
        let (activity_tx, _) = broadcast::channel(16);
        CaptureContext {
            frame_samples: 4,
            sample_rate: 16_000,
            volume_gain: 1.0,
            outlet,
            signals: Arc::new(SessionSignals::default()),
            activity_tx,
            activity_seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(SessionDiagnostics::default()),
        }
    }

    #[test]
    fn rms_of_constant_half_is_half() {
        assert_relative_eq!(rms(&vec![0.5; 4096]), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn rms_of_empty_is_zero() {
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn volume_is_clamped_to_unit_range() {
        assert_eq!(volume_from_rms(0.5, 5.0), 1.0);
        assert_relative_eq!(volume_from_rms(0.1, 5.0), 0.5, epsilon = 1e-6);
        assert_eq!(volume_from_rms(f32::NAN, 5.0), 0.0);
    }

    #[test]
    fn constant_half_frame_encodes_to_16383() {
        let outlet = Arc::new(OnceLock::new());
        let (mut handle, mut ends) = open_link(8);
        let _ = outlet.set(handle.link.clone());
        let ctx = context(Arc::clone(&outlet));
        let signals = Arc::clone(&ctx.signals);
        let mut pipeline = CapturePipeline::new(ctx);

        pipeline.push(&[0.5; 4]);

        let frame = ends.audio.try_recv().expect("frame forwarded");
        let samples: Vec<i16> = frame
            .pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![16383; 4]);
        assert_relative_eq!(signals.volume(), 0.5, epsilon = 1e-6);
        assert!(handle.events.try_recv().is_err());
    }

    #[test]
    fn frames_are_fixed_size_and_in_order() {
        let outlet = Arc::new(OnceLock::new());
        let (handle, mut ends) = open_link(8);
        let _ = outlet.set(handle.link.clone());
        let ctx = context(Arc::clone(&outlet));
        let diagnostics = Arc::clone(&ctx.diagnostics);
        let mut pipeline = CapturePipeline::new(ctx);

        pipeline.push(&[0.1; 3]);
        assert!(ends.audio.try_recv().is_err(), "partial frame must wait");
        pipeline.push(&[0.1; 7]);

        let seqs: Vec<u64> = std::iter::from_fn(|| ends.audio.try_recv().ok())
            .map(|f| {
                assert_eq!(f.sample_count(), 4);
                f.seq
            })
            .collect();
        assert_eq!(seqs, vec![0, 1]);
        let snap = diagnostics.snapshot();
        assert_eq!(snap.frames_produced, 2);
        assert_eq!(snap.frames_sent, 2);
        assert!(snap.frames_accounted());
    }

    #[test]
    fn full_queue_drops_are_counted() {
        let outlet = Arc::new(OnceLock::new());
        let (handle, _ends) = open_link(1);
        let _ = outlet.set(handle.link.clone());
        let ctx = context(Arc::clone(&outlet));
        let diagnostics = Arc::clone(&ctx.diagnostics);
        let mut pipeline = CapturePipeline::new(ctx);

        pipeline.push(&[0.2; 12]);

        let snap = diagnostics.snapshot();
        assert_eq!(snap.frames_produced, 3);
        assert_eq!(snap.frames_sent, 1);
        assert_eq!(snap.frames_dropped, 2);
        assert!(snap.frames_accounted());
    }

    #[test]
    fn activity_event_per_frame() {
        let outlet = Arc::new(OnceLock::new());
        let (handle, _ends) = open_link(8);
        let _ = outlet.set(handle.link.clone());
        let ctx = context(outlet);
        let mut activity_rx = ctx.activity_tx.subscribe();
        let mut pipeline = CapturePipeline::new(ctx);

        pipeline.push(&[0.0; 8]);

        assert_eq!(activity_rx.try_recv().unwrap().seq, 0);
        assert_eq!(activity_rx.try_recv().unwrap().seq, 1);
    }
}

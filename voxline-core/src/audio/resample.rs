//! Sample-rate conversion between hardware rates and wire rates.
//!
//! Microphones commonly run at 44.1 or 48 kHz while the backend expects
//! 16 kHz; assistant audio arrives at 24 kHz while speakers run at the
//! device's native rate. `RateConverter` wraps a rubato `FastFixedIn` for both
//! directions and is a plain copy when the rates already match.
//!
//! Runs on the drain / scheduling threads, never inside a hardware callback.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, VoxlineError};

/// Converts f32 mono audio from one fixed sample rate to another.
///
/// Over a stream that ends with [`RateConverter::flush`] the output is
/// exactly `round(input * to / from)` samples, aligned with the input: the
/// resampler's own delay is trimmed from the front and made up at the end.
pub struct RateConverter {
    /// `None` when both rates are equal.
    resampler: Option<FastFixedIn<f32>>,
    ratio: f64,
    /// Input not yet forming a full `chunk_size` block.
    pending: Vec<f32>,
    chunk_size: usize,
    output_buf: Vec<Vec<f32>>,
    /// Leading output samples still to drop.
    skip: usize,
    /// Input samples accepted since the stream started.
    input_total: u64,
    /// Output samples emitted since the stream started.
    output_total: u64,
}

impl RateConverter {
    /// # Errors
    /// `VoxlineError::Resample` if rubato rejects the configuration.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                ratio: 1.0,
                pending: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                skip: 0,
                input_total: 0,
                output_total: 0,
            });
        }
        if from_rate == 0 || to_rate == 0 || chunk_size == 0 {
            return Err(VoxlineError::Resample(format!(
                "invalid conversion {from_rate} Hz -> {to_rate} Hz, chunk {chunk_size}"
            )));
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| VoxlineError::Resample(e.to_string()))?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];
        let skip = resampler.output_delay();

        tracing::info!(from_rate, to_rate, chunk_size, delay = skip, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            ratio,
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
            skip,
            input_total: 0,
            output_total: 0,
        })
    }

    /// Convert as much of `samples` as forms whole blocks; the remainder is
    /// kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.resampler.is_none() {
            return samples.to_vec();
        }
        self.pending.extend_from_slice(samples);
        self.input_total += samples.len() as u64;
        let mut out = Vec::new();
        self.run_full_blocks(&mut out);
        out
    }

    /// End the stream: emit everything still owed for the input seen so
    /// far, then start over as if freshly built.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.backlog_frames() == 0 {
            self.clear();
            return Vec::new();
        }
        let expected = self.expected_output();
        let mut out = Vec::new();

        let padded = self.pending.len().div_ceil(self.chunk_size) * self.chunk_size;
        self.pending.resize(padded, 0.0);
        self.run_full_blocks(&mut out);

        // Push the delayed tail out with silence.
        let mut rounds = 0;
        while self.output_total < expected && rounds < MAX_TAIL_BLOCKS {
            self.pending.resize(self.chunk_size, 0.0);
            self.run_full_blocks(&mut out);
            rounds += 1;
        }

        let owed = expected as i64 - self.output_total as i64;
        let len = (out.len() as i64 + owed).max(0) as usize;
        out.resize(len, 0.0);

        self.clear();
        out
    }

    /// Discard the remainder and start over.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.input_total = 0;
        self.output_total = 0;
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
            self.skip = resampler.output_delay();
        }
    }

    /// Output samples owed for input already accepted but not yet emitted
    /// (held-back remainder plus resampler delay).
    pub fn backlog_frames(&self) -> u64 {
        if self.resampler.is_none() {
            return 0;
        }
        self.expected_output().saturating_sub(self.output_total)
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    fn expected_output(&self) -> u64 {
        (self.input_total as f64 * self.ratio).round() as u64
    }

    fn run_full_blocks(&mut self, out: &mut Vec<f32>) {
        let Some(resampler) = self.resampler.as_mut() else {
            return;
        };
        while self.pending.len() >= self.chunk_size {
            let block = &self.pending[..self.chunk_size];
            match resampler.process_into_buffer(&[block], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    let trimmed = produced.min(self.skip);
                    self.skip -= trimmed;
                    let fresh = &self.output_buf[0][trimmed..produced];
                    self.output_total += fresh.len() as u64;
                    out.extend_from_slice(fresh);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.pending.drain(..self.chunk_size);
        }
    }
}

/// Upper bound on silent blocks fed to drain the resampler delay.
const MAX_TAIL_BLOCKS: usize = 8;

/// One-shot conversion of a complete buffer; output length is exactly
/// `round(len * to / from)`.
///
/// # Errors
/// `VoxlineError::Resample` if either rate is zero.
pub fn convert(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    let chunk = (from_rate as usize / 100).max(1);
    let mut converter = RateConverter::new(from_rate, to_rate, chunk)?;
    let mut out = converter.process(samples);
    out.extend(converter.flush());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_rates_copy_input() {
        let mut rc = RateConverter::new(16_000, 16_000, 480).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..100).map(|i| i as f32 * 0.01).collect();
        assert_eq!(rc.process(&samples), samples);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn downsample_48k_to_16k_is_exact_after_flush() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        let mut out = rc.process(&vec![0.1f32; 960]);
        out.extend(rc.flush());
        assert_eq!(out.len(), 320);
    }

    #[test]
    fn upsample_24k_to_48k_is_exact_after_flush() {
        let mut rc = RateConverter::new(24_000, 48_000, 240).unwrap();
        let mut out = rc.process(&vec![0.1f32; 240]);
        assert_eq!(out.len() as u64 + rc.backlog_frames(), 480);
        out.extend(rc.flush());
        assert_eq!(out.len(), 480);
    }

    #[test]
    fn emitted_plus_backlog_tracks_the_ratio() {
        let mut rc = RateConverter::new(24_000, 48_000, 240).unwrap();
        let mut emitted = 0u64;
        for n in 1..=5u64 {
            emitted += rc.process(&vec![0.2f32; 1000]).len() as u64;
            assert_eq!(emitted + rc.backlog_frames(), n * 2000);
        }
        emitted += rc.flush().len() as u64;
        assert_eq!(emitted, 10_000);
        assert_eq!(rc.backlog_frames(), 0);
    }

    #[test]
    fn remainder_waits_until_flush() {
        let mut rc = RateConverter::new(24_000, 48_000, 240).unwrap();
        assert!(rc.process(&vec![0.0f32; 100]).is_empty());
        assert_eq!(rc.backlog_frames(), 200);
        assert_eq!(rc.flush().len(), 200);
        assert_eq!(rc.backlog_frames(), 0);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn one_shot_convert_has_exact_length() {
        assert_eq!(convert(&vec![0.3f32; 4800], 48_000, 24_000).unwrap().len(), 2400);
        assert_eq!(convert(&vec![0.3f32; 2000], 24_000, 44_100).unwrap().len(), 3675);
        assert_eq!(convert(&[0.5, -0.5], 24_000, 24_000).unwrap(), vec![0.5, -0.5]);
    }

    #[test]
    fn clear_discards_remainder() {
        let mut rc = RateConverter::new(24_000, 48_000, 240).unwrap();
        rc.process(&vec![0.0f32; 100]);
        rc.clear();
        assert_eq!(rc.backlog_frames(), 0);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(RateConverter::new(0, 16_000, 480).is_err());
    }
}

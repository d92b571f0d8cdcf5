//! Typed audio units passed between capture, codec, transport and playback.

/// One fixed-length batch of microphone samples plus its loudness.
///
/// Created once per assembled block on the capture drain thread and consumed
/// exactly once by the codec.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFrame {
    /// Capture order, starting at 0 for each session.
    pub seq: u64,
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (16000 on the wire).
    pub sample_rate: u32,
    /// UI volume in [0.0, 1.0], derived from the frame RMS.
    pub volume: f32,
}

impl CaptureFrame {
    /// Returns the duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Wire-ready PCM16 little-endian payload for one `CaptureFrame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Same sequence number as the `CaptureFrame` it was encoded from.
    pub seq: u64,
    /// 16-bit signed little-endian samples.
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

impl EncodedFrame {
    /// MIME type announced to the backend, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Number of PCM16 samples carried.
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }
}

/// One decoded unit of synthesized assistant audio awaiting playback.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    /// Arrival order as delivered by the transport.
    pub seq: u64,
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (24000 from the backend).
    pub sample_rate: u32,
}

impl PlaybackChunk {
    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Returns true if the chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_chunk_duration_at_24k() {
        let chunk = PlaybackChunk {
            seq: 0,
            samples: vec![0.0; 2400],
            sample_rate: 24_000,
        };
        assert!((chunk.duration_secs() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn encoded_frame_reports_mime_and_count() {
        let frame = EncodedFrame {
            seq: 3,
            pcm: vec![0; 8192],
            sample_rate: 16_000,
        };
        assert_eq!(frame.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(frame.sample_count(), 4096);
    }
}

//! Conversion between normalized f32 samples and the PCM16 wire format.
//!
//! ## Scaling
//!
//! Encoding is deliberately asymmetric: negative samples scale by `32768`,
//! non-negative samples by `32767`, and the product is truncated toward zero.
//! The backend's decoder expects exactly this mapping, so `0.5` encodes to
//! `16383` and `-1.0` to `-32768`.
//!
//! Decoding divides every sample by `32768.0`.
//!
//! Base64 is the only transport-safe representation used on the wire and it
//! stays behind this module so the rest of the engine only sees raw bytes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::buffering::{CaptureFrame, EncodedFrame, PlaybackChunk};
use crate::error::{Result, VoxlineError};

/// Map one normalized sample onto a signed 16-bit value.
pub fn sample_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Map one signed 16-bit value back to a normalized sample.
pub fn i16_to_sample(value: i16) -> f32 {
    f32::from(value) / 32768.0
}

/// Encode normalized samples as 16-bit signed little-endian PCM.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&sample_to_i16(s).to_le_bytes());
    }
    out
}

/// Decode 16-bit signed little-endian PCM into normalized samples.
///
/// A trailing odd byte cannot form a sample and is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16_to_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

/// Encode one capture frame into its wire payload. Keeps the frame's `seq`.
pub fn encode_frame(frame: &CaptureFrame) -> EncodedFrame {
    EncodedFrame {
        seq: frame.seq,
        pcm: encode_pcm16(&frame.samples),
        sample_rate: frame.sample_rate,
    }
}

/// Decode an inbound PCM16 payload into a playback chunk.
pub fn decode_chunk(seq: u64, pcm: &[u8], sample_rate: u32) -> PlaybackChunk {
    PlaybackChunk {
        seq,
        samples: decode_pcm16(pcm),
        sample_rate,
    }
}

pub fn to_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn from_base64(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded.trim())
        .map_err(|e| VoxlineError::Codec(format!("invalid base64 payload: {e}")))
}

/// Parse the sample rate out of a MIME type such as `audio/pcm;rate=24000`.
pub fn rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: f32 = 1.0 / 32768.0;

    #[test]
    fn encodes_reference_values() {
        let cases: &[(f32, i16)] = &[
            (0.0, 0),
            (0.5, 16383),
            (1.0, 32767),
            (-1.0, -32768),
            (-0.5, -16384),
            (2.5, 32767),
            (-3.0, -32768),
            (0.25, 8191),
            (-0.25, -8192),
        ];
        for &(input, expected) in cases {
            assert_eq!(sample_to_i16(input), expected, "input={input}");
        }
    }

    #[test]
    fn nan_encodes_as_silence() {
        assert_eq!(sample_to_i16(f32::NAN), 0);
    }

    #[test]
    fn pcm16_is_little_endian() {
        let bytes = encode_pcm16(&[0.5, -1.0]);
        assert_eq!(bytes, vec![0xFF, 0x3F, 0x00, 0x80]);
    }

    #[test]
    fn decode_divides_by_32768() {
        let samples = decode_pcm16(&[0x00, 0x80, 0xFF, 0x7F, 0x00, 0x00]);
        assert_eq!(samples[0], -1.0);
        assert_eq!(samples[1], 32767.0 / 32768.0);
        assert_eq!(samples[2], 0.0);
    }

    #[test]
    fn decode_ignores_trailing_odd_byte() {
        assert_eq!(decode_pcm16(&[0x00, 0x40, 0x12]).len(), 1);
    }

    #[test]
    fn negative_round_trip_within_one_step() {
        for i in 0..=1000 {
            let x = -(i as f32) / 1000.0;
            let back = decode_pcm16(&encode_pcm16(&[x]))[0];
            assert!((x - back).abs() <= STEP, "x={x} back={back}");
        }
    }

    #[test]
    fn positive_round_trip_bounded_by_scale_asymmetry() {
        // 32767 vs 32768 costs up to one extra step at full scale.
        for i in 0..=1000 {
            let x = i as f32 / 1000.0;
            let back = decode_pcm16(&encode_pcm16(&[x]))[0];
            assert!(back <= x, "decoded value must not exceed input");
            assert!((x - back) <= STEP * (1.0 + x) + 1e-7, "x={x} back={back}");
        }
    }

    #[test]
    fn boundary_values_are_asymmetric() {
        let back = decode_pcm16(&encode_pcm16(&[1.0, -1.0]));
        assert_eq!(back[0], 32767.0 / 32768.0);
        assert_eq!(back[1], -1.0);
    }

    #[test]
    fn encode_frame_keeps_sequence_and_rate() {
        let frame = CaptureFrame {
            seq: 9,
            samples: vec![0.5; 4],
            sample_rate: 16_000,
            volume: 1.0,
        };
        let encoded = encode_frame(&frame);
        assert_eq!(encoded.seq, 9);
        assert_eq!(encoded.sample_rate, 16_000);
        assert_eq!(encoded.pcm.len(), 8);
    }

    #[test]
    fn base64_boundary_rejects_garbage() {
        assert_eq!(from_base64(&to_base64(&[1, 2, 3])).unwrap(), vec![1, 2, 3]);
        assert!(from_base64("not base64!!").is_err());
    }

    #[test]
    fn parses_rate_from_mime() {
        assert_eq!(rate_from_mime("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(rate_from_mime("audio/pcm; rate=16000"), Some(16_000));
        assert_eq!(rate_from_mime("audio/pcm"), None);
    }
}

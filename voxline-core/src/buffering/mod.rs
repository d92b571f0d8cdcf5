//! Lock-free SPSC ring buffers for audio samples, plus the typed frames that
//! move between the session's stages.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback.

pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use frame::{CaptureFrame, EncodedFrame, PlaybackChunk};
pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Type alias for the producer half of a sample ring.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half of a sample ring.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Capture ring: 2^18 = 262 144 samples ≈ 5.4 s at 48 kHz.
/// The drain thread empties it every few milliseconds.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 18;

/// Playback ring: 2^22 = 4 194 304 samples ≈ 87 s at 48 kHz.
/// Holds the whole queued backlog of a long assistant turn.
pub const PLAYBACK_RING_CAPACITY: usize = 1 << 22;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(capacity).split()
}

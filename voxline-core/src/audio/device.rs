//! Hardware ports.
//!
//! The session never talks to cpal directly. It asks an [`AudioHost`] for one
//! output and one input device and drives them through the traits below, so
//! the whole lifecycle can be exercised in tests without real hardware.

use serde::{Deserialize, Serialize};

use crate::buffering::PlaybackChunk;
use crate::error::DeviceError;

/// Receives mono f32 blocks at the requested input rate, in capture order.
///
/// Called from the input drain thread, never from the real-time callback.
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// What the session asks of the microphone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRequest {
    /// Rate the sink expects (16000 on the wire).
    pub sample_rate: u32,
    /// Exact device name to prefer; falls back to the default input.
    pub preferred_device: Option<String>,
}

/// What the session asks of the speaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRequest {
    /// Rate of the decoded chunks handed to `schedule` (24000 from the backend).
    pub sample_rate: u32,
}

/// Source of audio devices. Implemented by the cpal backend and by test fakes.
pub trait AudioHost: Send + Sync + 'static {
    /// Acquire the output device context.
    ///
    /// # Errors
    /// Any failure must leave nothing acquired.
    fn open_output(&self, request: &OutputRequest) -> Result<Box<dyn OutputDevice>, DeviceError>;

    /// Acquire the microphone. The returned device starts gated: `sink`
    /// receives nothing until `set_streaming(true)`.
    ///
    /// # Errors
    /// Any failure must leave nothing acquired.
    fn open_input(
        &self,
        request: &InputRequest,
        sink: SampleSink,
    ) -> Result<Box<dyn InputDevice>, DeviceError>;
}

/// An acquired microphone.
pub trait InputDevice: Send {
    /// Open or close the gate between the hardware and the sink.
    fn set_streaming(&self, enabled: bool);

    /// Stop every underlying hardware track and release the device.
    /// Idempotent.
    fn stop(&mut self);
}

/// An acquired speaker with its own clock.
pub trait OutputDevice: Send {
    /// Current time on the output device's clock, in seconds.
    fn now(&self) -> f64;

    /// Queue `chunk` to begin at `start` seconds on the device clock.
    fn schedule(&mut self, start: f64, chunk: &PlaybackChunk);

    /// The current run of chunks has ended; release anything held back
    /// waiting for more audio so the tail plays now.
    fn end_of_stream(&mut self) {}

    /// Abandon everything queued but not yet played.
    fn flush(&mut self);

    /// Stop the stream and release the device. Idempotent.
    fn close(&mut self);
}

/// Direction of an enumerated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
}

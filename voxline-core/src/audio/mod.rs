//! Audio side of a session: microphone framing, gapless playback and the
//! hardware ports both run on.
//!
//! Real-time callbacks never allocate, lock or perform I/O. They only move
//! samples through lock-free rings (see [`crate::buffering`]); everything
//! else runs on ordinary threads.

pub mod capture;
pub mod device;
pub mod playback;
pub mod resample;

#[cfg(feature = "audio-cpal")]
pub mod cpal_host;

#[cfg(feature = "audio-cpal")]
pub use cpal_host::{list_input_devices, list_output_devices, CpalHost};

pub use capture::CapturePipeline;
pub use device::{AudioHost, DeviceInfo, InputDevice, OutputDevice};
pub use playback::{Playback, PlaybackScheduler};

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}

//! # voxline-core
//!
//! Real-time voice session engine: a bidirectional audio channel to a remote
//! speech-to-speech backend with gapless playback, barge-in and embedded
//! tool calls.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → capture ring → CapturePipeline ─ PCM16 ─► TransportLink ─► backend
//!                                                                           │
//! Speaker ◄─ playback ring ◄─ Playback (cursor) ◄─ decode ◄─ ConnectionEvent ◄┘
//!                                                        └─► ToolDispatcher ─► ToolResponse
//! ```
//!
//! `SessionManager` owns the hardware and the channel for exactly one session
//! at a time. Audio callbacks are zero-alloc; all heap work happens on the
//! drain threads and the session event loop.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod codec;
pub mod error;
pub mod ipc;
pub mod session;
pub mod tools;
pub mod transport;

// Convenience re-exports for downstream crates
pub use audio::device::{AudioHost, DeviceInfo};
pub use error::{ConnectionError, DeviceError, ToolDispatchError, VoxlineError};
pub use ipc::events::{
    AudioActivityEvent, NoticeLevel, NotificationEvent, SessionStatus, SessionStatusEvent,
};
pub use session::{DiagnosticsSnapshot, EngineConfig, SessionManager, SessionState};
pub use tools::{
    ApplicationDraft, ApplicationSink, Notifier, QualificationStatus, SubmitApplicationTool,
    ToolHandler, ToolRegistry,
};
pub use transport::{ConnectionEvent, Transport};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalHost;

#[cfg(feature = "websocket")]
pub use transport::{WebSocketConfig, WebSocketTransport};

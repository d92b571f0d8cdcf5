use std::time::Duration;

use thiserror::Error;

/// Failures acquiring the microphone or speaker.
///
/// Always surfaced before any network activity is attempted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("audio device permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio device not found: {0}")]
    NotFound(String),

    #[error("audio device unavailable: {0}")]
    Unavailable(String),
}

/// Failures during the initial handshake with the inference backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("no session-open acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("channel closed before the session opened")]
    Closed,
}

/// Why a tool invocation could not be answered with a handler result.
///
/// Never escapes the dispatcher as an `Err`: it is folded into an
/// error-shaped `ToolResponse` so the remote turn can still close.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolDispatchError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool {tool} failed: {reason}")]
    Handler { tool: String, reason: String },
}

/// All errors produced by voxline-core.
#[derive(Debug, Error)]
pub enum VoxlineError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("a voice session is already active")]
    AlreadyActive,

    #[error("connect cancelled by disconnect")]
    Cancelled,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxlineError>;

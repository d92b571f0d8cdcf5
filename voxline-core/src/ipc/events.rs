//! Event types broadcast to the host.
//!
//! ## Channels
//!
//! | Event | Subscribe with |
//! |-------|----------------|
//! | `SessionStatusEvent` | `SessionManager::subscribe_status` |
//! | `AudioActivityEvent` | `SessionManager::subscribe_activity` |
//! | `NotificationEvent` | `SessionManager::subscribe_notifications` |
//!
//! All types serialise with camelCase fields so a web front end can consume
//! them unchanged.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

/// Emitted whenever the session state machine transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    /// Session the transition belongs to.
    pub session_id: String,
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Flattened session state, as seen from outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

// ---------------------------------------------------------------------------
// Audio activity
// ---------------------------------------------------------------------------

/// Emitted per capture frame and whenever the speaking flag flips.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Microphone level in [0.0, 1.0].
    pub volume: f32,
    /// Whether assistant audio is currently playing.
    pub is_speaking: bool,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// A user-facing notice (the host decides how to display it).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

//! `SessionManager`: the single owner of the microphone, the speaker and the
//! backend channel.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ─► Connecting ─► Open ─► Closing ─► Closed
//!             │                    ▲
//!             └──► Error(reason) ──┘ (disconnect)
//! ```
//!
//! `connect()` acquires, strictly in this order: output device → input device
//! → backend channel → wait for `Opened` → open the microphone gate. A device
//! failure therefore never reaches the network, and no frame is sent before
//! the backend accepted the session.
//!
//! `disconnect()` runs the full teardown from any state: close the channel,
//! stop the microphone, release the speaker, reset `connected` / `speaking`
//! / `volume` and the playback cursor. Calling it again is a no-op. Every
//! failure path runs the same teardown.
//!
//! ## Locking
//!
//! Per-session state lives behind a `parking_lot::Mutex` that is never held
//! across an `.await`. After every await `connect()` re-checks that it is
//! still `Connecting`; if a `disconnect()` slipped in, whatever was acquired
//! meanwhile is released and `connect()` returns `VoxlineError::Cancelled`.

pub mod config;
pub mod diagnostics;
mod event_loop;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::capture::{CaptureContext, CapturePipeline};
use crate::audio::device::{AudioHost, InputDevice, InputRequest, OutputRequest};
use crate::audio::playback::Playback;
use crate::error::{ConnectionError, Result, VoxlineError};
use crate::ipc::events::{
    AudioActivityEvent, NoticeLevel, NotificationEvent, SessionStatus, SessionStatusEvent,
};
use crate::ipc::signals::SessionSignals;
use crate::tools::{Notifier, ToolDispatcher, ToolRegistry};
use crate::transport::{
    ConnectionEvent, ResponseModality, SessionConfig, Transport, TransportHandle, TransportLink,
};

pub use config::EngineConfig;
pub use diagnostics::{DiagnosticsSnapshot, SessionDiagnostics};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Where a session is in its life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Error(String),
}

impl SessionState {
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::Idle => SessionStatus::Idle,
            Self::Connecting => SessionStatus::Connecting,
            Self::Open => SessionStatus::Open,
            Self::Closing => SessionStatus::Closing,
            Self::Closed => SessionStatus::Closed,
            Self::Error(_) => SessionStatus::Error,
        }
    }

    /// Holds, or is acquiring, the hardware.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

/// One connect/disconnect cycle and everything it acquired.
pub(crate) struct AudioSession {
    pub(crate) id: String,
    pub(crate) state: SessionState,
    pub(crate) last_error: Option<String>,
    pub(crate) input: Option<Box<dyn InputDevice>>,
    pub(crate) playback: Option<Playback>,
    pub(crate) link: Option<TransportLink>,
    pub(crate) event_task: Option<JoinHandle<()>>,
}

impl AudioSession {
    fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::Idle,
            last_error: None,
            input: None,
            playback: None,
            link: None,
            event_task: None,
        }
    }
}

/// Observable state shared with the event loop and the capture thread.
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) signals: Arc<SessionSignals>,
    pub(crate) status_tx: broadcast::Sender<SessionStatusEvent>,
    pub(crate) activity_tx: broadcast::Sender<AudioActivityEvent>,
    pub(crate) notice_tx: broadcast::Sender<NotificationEvent>,
    pub(crate) activity_seq: Arc<AtomicU64>,
    pub(crate) diagnostics: Arc<SessionDiagnostics>,
    pub(crate) dispatcher: ToolDispatcher,
}

impl Shared {
    pub(crate) fn transition(&self, session: &mut AudioSession, state: SessionState) {
        info!(session_id = %session.id, state = ?state, "session state changed");
        let detail = match &state {
            SessionState::Error(reason) => Some(reason.clone()),
            _ => None,
        };
        let _ = self.status_tx.send(SessionStatusEvent {
            session_id: session.id.clone(),
            status: state.status(),
            detail,
        });
        session.state = state;
    }

    pub(crate) fn emit_activity(&self) {
        let _ = self.activity_tx.send(AudioActivityEvent {
            seq: self.activity_seq.fetch_add(1, Ordering::Relaxed),
            volume: self.signals.volume(),
            is_speaking: self.signals.is_speaking(),
        });
    }

    pub(crate) fn set_speaking(&self, speaking: bool) {
        if self.signals.set_speaking(speaking) {
            self.emit_activity();
        }
    }

    pub(crate) fn notify(&self, level: NoticeLevel, title: &str, message: String) {
        self.notice_tx.notify(NotificationEvent {
            level,
            title: title.into(),
            message,
        });
    }

    /// The disconnect sequence. Ends in `end`.
    ///
    /// `abort_events` is false when called from the event loop itself.
    pub(crate) fn teardown(&self, session: &mut AudioSession, end: SessionState, abort_events: bool) {
        self.transition(session, SessionState::Closing);

        if let Some(task) = session.event_task.take() {
            if abort_events {
                task.abort();
            }
        }
        if let Some(link) = session.link.take() {
            link.close();
        }
        if let Some(mut input) = session.input.take() {
            input.stop();
        }
        if let Some(mut playback) = session.playback.take() {
            playback.close();
        }

        self.signals.reset();
        self.emit_activity();
        self.transition(session, end);
    }
}

/// Public surface of the engine: `connect()`, `disconnect()` and the
/// observable values `connected`, `is_speaking`, `volume`.
///
/// `Send + Sync`; share it behind an `Arc`.
pub struct SessionManager {
    config: EngineConfig,
    host: Arc<dyn AudioHost>,
    transport: Arc<dyn Transport>,
    tools: Arc<ToolRegistry>,
    shared: Shared,
    current: Mutex<Option<Arc<Mutex<AudioSession>>>>,
}

impl SessionManager {
    pub fn new(
        config: EngineConfig,
        host: Arc<dyn AudioHost>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (notice_tx, _) = broadcast::channel(BROADCAST_CAP);
        let diagnostics = Arc::new(SessionDiagnostics::default());
        let tools = Arc::new(ToolRegistry::new());

        Self {
            config,
            host,
            transport,
            tools: Arc::clone(&tools),
            shared: Shared {
                signals: Arc::new(SessionSignals::default()),
                status_tx,
                activity_tx,
                notice_tx,
                activity_seq: Arc::new(AtomicU64::new(0)),
                dispatcher: ToolDispatcher::new(tools, Arc::clone(&diagnostics)),
                diagnostics,
            },
            current: Mutex::new(None),
        }
    }

    /// Install the tools advertised to the backend on every connect.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        let tools = Arc::new(tools);
        self.shared.dispatcher = ToolDispatcher::new(
            Arc::clone(&tools),
            Arc::clone(&self.shared.diagnostics),
        );
        self.tools = tools;
        self
    }

    /// Open a session. Returns its id once the backend acknowledged it and
    /// the microphone is streaming.
    ///
    /// # Errors
    /// - `VoxlineError::AlreadyActive` if a session is connecting or open.
    /// - `VoxlineError::Device` if a device could not be acquired; the
    ///   backend is never contacted in that case.
    /// - `VoxlineError::Connection` if the handshake failed or timed out.
    /// - `VoxlineError::Cancelled` if `disconnect()` ran meanwhile.
    pub async fn connect(&self) -> Result<String> {
        let session = {
            let mut current = self.current.lock();
            if let Some(existing) = current.as_ref() {
                if existing.lock().state.is_active() {
                    return Err(VoxlineError::AlreadyActive);
                }
            }
            let session = Arc::new(Mutex::new(AudioSession::new()));
            *current = Some(Arc::clone(&session));
            session
        };

        self.shared.diagnostics.reset();
        self.shared.dispatcher.reset();
        let id = {
            let mut s = session.lock();
            self.shared.transition(&mut s, SessionState::Connecting);
            s.id.clone()
        };

        match self.establish(&session).await {
            Ok(()) => Ok(id),
            Err(e) => {
                let mut s = session.lock();
                if s.state != SessionState::Connecting {
                    debug!(session_id = %id, "connect superseded by disconnect: {e}");
                    return Err(VoxlineError::Cancelled);
                }
                let reason = e.to_string();
                warn!(session_id = %id, "connect failed: {reason}");
                s.last_error = Some(reason.clone());
                self.shared.teardown(&mut s, SessionState::Error(reason), true);
                Err(e)
            }
        }
    }

    async fn establish(&self, session: &Arc<Mutex<AudioSession>>) -> Result<()> {
        let cfg = &self.config;

        // 1. Speaker.
        let output = self.host.open_output(&OutputRequest {
            sample_rate: cfg.output_sample_rate,
        })?;
        let mut playback = Playback::new(
            output,
            cfg.output_sample_rate,
            cfg.drain_tolerance.as_secs_f64(),
        );
        {
            let mut s = session.lock();
            if s.state != SessionState::Connecting {
                drop(s);
                playback.close();
                return Err(VoxlineError::Cancelled);
            }
            s.playback = Some(playback);
        }

        // 2. Microphone, gated until the backend accepts the session.
        let outlet = Arc::new(OnceLock::new());
        let pipeline = CapturePipeline::new(CaptureContext {
            frame_samples: cfg.frame_samples,
            sample_rate: cfg.capture_sample_rate,
            volume_gain: cfg.volume_gain,
            outlet: Arc::clone(&outlet),
            signals: Arc::clone(&self.shared.signals),
            activity_tx: self.shared.activity_tx.clone(),
            activity_seq: Arc::clone(&self.shared.activity_seq),
            diagnostics: Arc::clone(&self.shared.diagnostics),
        });
        let mut input = self.host.open_input(
            &InputRequest {
                sample_rate: cfg.capture_sample_rate,
                preferred_device: cfg.preferred_input_device.clone(),
            },
            pipeline.into_sink(),
        )?;
        {
            let mut s = session.lock();
            if s.state != SessionState::Connecting {
                drop(s);
                input.stop();
                return Err(VoxlineError::Cancelled);
            }
            s.input = Some(input);
        }

        // 3. Backend channel.
        let deadline = Instant::now() + cfg.handshake_timeout;
        let timeout = ConnectionError::Timeout(cfg.handshake_timeout);
        let session_config = SessionConfig {
            response_modality: ResponseModality::Audio,
            voice_name: cfg.voice_name.clone(),
            system_instruction: cfg.system_instruction.clone(),
            tools: self.tools.declarations(),
            outbound_capacity: cfg.outbound_capacity,
        };
        let TransportHandle { link, mut events } =
            tokio::time::timeout_at(deadline, self.transport.connect(&session_config))
                .await
                .map_err(|_| timeout.clone())??;
        {
            let mut s = session.lock();
            if s.state != SessionState::Connecting {
                drop(s);
                link.close();
                return Err(VoxlineError::Cancelled);
            }
            s.link = Some(link.clone());
        }
        let _ = outlet.set(link.clone());

        // 4. Wait for the acknowledgement.
        loop {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .map_err(|_| timeout.clone())?;
            match event {
                Some(ConnectionEvent::Opened) => break,
                Some(ConnectionEvent::TransportError(reason)) => {
                    return Err(ConnectionError::Handshake(reason).into())
                }
                Some(ConnectionEvent::Closed) | None => return Err(ConnectionError::Closed.into()),
                // Every invocation is owed an answer, open or not.
                Some(ConnectionEvent::ToolCall(invocations)) => {
                    for invocation in invocations {
                        debug!(tool = %invocation.name, id = %invocation.id, "tool call before session open");
                        drop(self.shared.dispatcher.dispatch(invocation, link.clone()));
                    }
                }
                Some(other) => debug!(?other, "event before session open ignored"),
            }
        }

        // 5. Go live.
        let mut s = session.lock();
        if s.state != SessionState::Connecting {
            return Err(VoxlineError::Cancelled);
        }
        if let Some(input) = s.input.as_ref() {
            input.set_streaming(true);
        }
        self.shared.signals.set_connected(true);
        self.shared.transition(&mut s, SessionState::Open);
        self.shared.emit_activity();
        s.event_task = Some(tokio::spawn(event_loop::run(
            Arc::clone(session),
            events,
            link,
            self.shared.clone(),
            cfg.poll_interval,
        )));
        info!(session_id = %s.id, "voice session open");
        Ok(())
    }

    /// Tear the current session down. Safe from any state, including
    /// mid-connect; a no-op when nothing is held.
    pub fn disconnect(&self) {
        let Some(session) = self.current.lock().clone() else {
            return;
        };
        let mut s = session.lock();
        if matches!(s.state, SessionState::Idle | SessionState::Closed) {
            return;
        }
        self.shared.teardown(&mut s, SessionState::Closed, true);
        info!(session_id = %s.id, "voice session closed");
    }

    /// State of the most recent session (`Idle` before the first connect).
    pub fn state(&self) -> SessionState {
        self.current
            .lock()
            .as_ref()
            .map_or(SessionState::Idle, |s| s.lock().state.clone())
    }

    pub fn session_id(&self) -> Option<String> {
        self.current.lock().as_ref().map(|s| s.lock().id.clone())
    }

    /// Why the most recent session failed or ended abnormally.
    pub fn last_error(&self) -> Option<String> {
        self.current
            .lock()
            .as_ref()
            .and_then(|s| s.lock().last_error.clone())
    }

    pub fn connected(&self) -> bool {
        self.shared.signals.connected()
    }

    pub fn is_speaking(&self) -> bool {
        self.shared.signals.is_speaking()
    }

    /// Microphone level in [0.0, 1.0].
    pub fn volume(&self) -> f32 {
        self.shared.signals.volume()
    }

    pub fn signals(&self) -> Arc<SessionSignals> {
        Arc::clone(&self.shared.signals)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.shared.activity_tx.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.shared.notice_tx.subscribe()
    }

    /// Publishes onto the notification channel; hand it to tool handlers.
    pub fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::new(self.shared.notice_tx.clone())
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    /// Tool invocations received but not yet answered.
    pub fn outstanding_tool_calls(&self) -> usize {
        self.shared.dispatcher.outstanding()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connecting_and_open_are_active() {
        assert!(SessionState::Connecting.is_active());
        assert!(SessionState::Open.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(!SessionState::Closing.is_active());
        assert!(!SessionState::Closed.is_active());
        assert!(!SessionState::Error("x".into()).is_active());
    }

    #[test]
    fn error_state_maps_to_error_status() {
        assert_eq!(
            SessionState::Error("boom".into()).status(),
            SessionStatus::Error
        );
        assert_eq!(SessionState::Closing.status(), SessionStatus::Closing);
    }
}

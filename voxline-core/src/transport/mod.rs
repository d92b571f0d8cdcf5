//! Persistent channel to the speech-to-speech backend.
//!
//! A [`Transport`] opens the channel and hands back a [`TransportHandle`]:
//!
//! - `link`: cheap-to-clone sending side. `send` never waits on the network:
//!   audio goes through a bounded queue and is dropped (and reported) when
//!   the queue is full; tool responses and close requests go through an
//!   unbounded control queue and are never dropped.
//! - `events`: inbound [`ConnectionEvent`]s in arrival order. The stream
//!   always ends with exactly one `Closed`, whoever closes first.
//!
//! Transports are assumed not to reorder messages; the engine cannot enforce
//! that and does not try to.

pub mod wire;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::buffering::EncodedFrame;
use crate::error::{ConnectionError, Result, VoxlineError};
use crate::tools::{ToolDeclaration, ToolInvocation, ToolResponse};

/// Output modality requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Audio,
}

/// Everything the backend needs to open a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub response_modality: ResponseModality,
    pub voice_name: String,
    pub system_instruction: String,
    pub tools: Vec<ToolDeclaration>,
    /// Capacity of the outbound audio queue, in frames.
    pub outbound_capacity: usize,
}

/// Inbound events, normalised from whatever the backend sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The backend acknowledged the session configuration.
    Opened,
    /// One chunk of synthesized PCM16 LE audio.
    InboundAudio { pcm: Vec<u8>, sample_rate: u32 },
    TurnComplete,
    /// The user talked over the assistant; queued playback must be abandoned.
    Interrupted,
    ToolCall(Vec<ToolInvocation>),
    TransportError(String),
    Closed,
}

/// Non-audio outbound traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    ToolResponse(ToolResponse),
    Close,
}

/// Result of a non-blocking audio send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// The outbound queue was full; the frame was dropped.
    Dropped,
    /// The channel is closed; the frame was discarded.
    Closed,
}

/// Opens channels to the backend.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a channel and send the session configuration.
    ///
    /// `Opened` arrives on the returned event stream once the backend
    /// acknowledges the configuration.
    ///
    /// # Errors
    /// `ConnectionError` if the channel cannot be established.
    async fn connect(&self, config: &SessionConfig)
        -> std::result::Result<TransportHandle, ConnectionError>;
}

/// An open channel as seen by the session.
#[derive(Debug)]
pub struct TransportHandle {
    pub link: TransportLink,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// The transport implementation's side of an open channel.
#[derive(Debug)]
pub struct LinkEnds {
    pub audio: mpsc::Receiver<EncodedFrame>,
    pub control: mpsc::UnboundedReceiver<Control>,
    pub events: EventEmitter,
}

/// Create a linked handle/ends pair with an audio queue of `audio_capacity` frames.
pub fn open_link(audio_capacity: usize) -> (TransportHandle, LinkEnds) {
    let (audio_tx, audio_rx) = mpsc::channel(audio_capacity.max(1));
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let emitter = EventEmitter {
        tx: events_tx,
        closed: Arc::new(AtomicBool::new(false)),
    };

    let link = TransportLink {
        audio: audio_tx,
        control: control_tx,
        events: emitter.clone(),
    };

    (
        TransportHandle {
            link,
            events: events_rx,
        },
        LinkEnds {
            audio: audio_rx,
            control: control_rx,
            events: emitter,
        },
    )
}

/// Delivers inbound events; refuses everything after `Closed`.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
}

impl EventEmitter {
    /// Deliver an event. Returns `false` once the channel is closed.
    ///
    /// `Closed` itself is routed through [`EventEmitter::finish`].
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        if event == ConnectionEvent::Closed {
            return self.finish();
        }
        if self.is_closed() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    /// Emit the terminal `Closed` event. Only the first call has any effect.
    pub fn finish(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(ConnectionEvent::Closed);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Sending side of an open channel.
#[derive(Debug, Clone)]
pub struct TransportLink {
    audio: mpsc::Sender<EncodedFrame>,
    control: mpsc::UnboundedSender<Control>,
    events: EventEmitter,
}

impl TransportLink {
    /// Enqueue one audio frame without waiting.
    pub fn send(&self, frame: EncodedFrame) -> SendOutcome {
        if self.events.is_closed() {
            return SendOutcome::Closed;
        }
        match self.audio.try_send(frame) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Enqueue the answer to a tool invocation. Never dropped while open.
    ///
    /// # Errors
    /// `VoxlineError::Transport` if the channel is already closed.
    pub fn send_tool_response(&self, response: ToolResponse) -> Result<()> {
        if self.events.is_closed() {
            return Err(VoxlineError::Transport("channel closed".into()));
        }
        self.control
            .send(Control::ToolResponse(response))
            .map_err(|_| VoxlineError::Transport("writer task gone".into()))
    }

    /// Close the channel. Idempotent; the event stream ends with `Closed`
    /// no matter how many times this is called.
    ///
    /// The writer is told to stop even when the remote side closed first.
    pub fn close(&self) {
        self.events.finish();
        let _ = self.control.send(Control::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(seq: u64) -> EncodedFrame {
        EncodedFrame {
            seq,
            pcm: vec![0, 0],
            sample_rate: 16_000,
        }
    }

    #[test]
    fn audio_preserves_order_and_drops_on_full_queue() {
        let (handle, mut ends) = open_link(2);
        assert_eq!(handle.link.send(frame(0)), SendOutcome::Queued);
        assert_eq!(handle.link.send(frame(1)), SendOutcome::Queued);
        assert_eq!(handle.link.send(frame(2)), SendOutcome::Dropped);

        assert_eq!(ends.audio.try_recv().unwrap().seq, 0);
        assert_eq!(ends.audio.try_recv().unwrap().seq, 1);
        assert!(ends.audio.try_recv().is_err());
    }

    #[test]
    fn close_is_idempotent_and_emits_one_closed() {
        let (mut handle, mut ends) = open_link(2);
        handle.link.close();
        handle.link.close();

        assert_eq!(handle.events.try_recv().unwrap(), ConnectionEvent::Closed);
        assert!(handle.events.try_recv().is_err());
        assert_eq!(ends.control.try_recv().unwrap(), Control::Close);
        assert_eq!(handle.link.send(frame(0)), SendOutcome::Closed);
    }

    #[test]
    fn events_after_close_are_refused() {
        let (mut handle, ends) = open_link(2);
        assert!(ends.events.emit(ConnectionEvent::Opened));
        assert!(ends.events.emit(ConnectionEvent::Closed));
        assert!(!ends.events.emit(ConnectionEvent::TurnComplete));
        handle.link.close();

        assert_eq!(handle.events.try_recv().unwrap(), ConnectionEvent::Opened);
        assert_eq!(handle.events.try_recv().unwrap(), ConnectionEvent::Closed);
        assert!(handle.events.try_recv().is_err());
    }

    #[test]
    fn tool_response_after_close_is_an_error() {
        let (handle, _ends) = open_link(1);
        handle.link.close();
        let response = ToolResponse {
            id: "1".into(),
            name: "t".into(),
            result: json!(null),
        };
        assert!(handle.link.send_tool_response(response).is_err());
    }
}

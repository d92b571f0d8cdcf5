//! WebSocket transport for a Live-style bidirectional generation endpoint.
//!
//! One connection per session. After the TLS/WebSocket handshake the setup
//! message is sent immediately; the backend answers with `setupComplete`,
//! which surfaces as `ConnectionEvent::Opened`.
//!
//! Two tasks own the socket halves:
//!
//! - writer: drains the control queue first (tool responses, close), then
//!   audio frames, one text message each.
//! - reader: parses every inbound message into connection events and ends
//!   the event stream with `Closed`.

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use crate::buffering::EncodedFrame;
use crate::error::ConnectionError;
use crate::transport::{
    open_link, wire, ConnectionEvent, Control, EventEmitter, LinkEnds, SessionConfig, Transport,
    TransportHandle,
};

const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub endpoint: String,
    /// Sent as the `key` query parameter when present.
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            api_key: None,
            model: DEFAULT_MODEL.into(),
        }
    }
}

pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    fn request_url(&self) -> Result<String, ConnectionError> {
        let mut url = url::Url::parse(&self.config.endpoint)
            .map_err(|e| ConnectionError::Handshake(format!("invalid endpoint: {e}")))?;
        if let Some(key) = self.config.api_key.as_deref() {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url.into())
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, config: &SessionConfig) -> Result<TransportHandle, ConnectionError> {
        let url = self.request_url()?;
        let setup = wire::setup_message(&self.config.model, config)
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;

        let (socket, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        info!(
            status = %response.status(),
            model = %self.config.model,
            "websocket connected"
        );

        let (mut sink, stream) = socket.split();
        sink.send(Message::Text(setup))
            .await
            .map_err(|e| ConnectionError::Handshake(format!("sending setup: {e}")))?;

        let (handle, ends) = open_link(config.outbound_capacity);
        let LinkEnds {
            audio,
            control,
            events,
        } = ends;

        tokio::spawn(write_loop(sink, audio, control, events.clone()));
        tokio::spawn(read_loop(stream, events));

        Ok(handle)
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut audio: mpsc::Receiver<EncodedFrame>,
    mut control: mpsc::UnboundedReceiver<Control>,
    events: EventEmitter,
) where
    S: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let encoded = tokio::select! {
            biased;
            ctrl = control.recv() => match ctrl {
                Some(Control::ToolResponse(response)) => wire::tool_response_message(&response),
                Some(Control::Close) | None => break,
            },
            frame = audio.recv() => match frame {
                Some(frame) => wire::audio_message(&frame),
                None => break,
            },
        };

        let text = match encoded {
            Ok(text) => text,
            Err(e) => {
                error!("outbound message not encodable: {e}");
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(text)).await {
            events.emit(ConnectionEvent::TransportError(format!("send failed: {e}")));
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!("websocket close: {e}");
    }
    debug!("websocket writer stopped");
}

async fn read_loop<S>(mut stream: S, events: EventEmitter)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let raw = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("ignoring non-UTF-8 binary message");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    if frame.code != CloseCode::Normal {
                        events.emit(ConnectionEvent::TransportError(format!(
                            "closed by backend ({}): {}",
                            frame.code, frame.reason
                        )));
                    } else {
                        info!("backend closed the channel");
                    }
                }
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                events.emit(ConnectionEvent::TransportError(e.to_string()));
                break;
            }
        };

        match wire::parse_server_message(&raw) {
            Ok(parsed) => {
                for event in parsed {
                    events.emit(event);
                }
            }
            Err(e) => warn!("{e}"),
        }

        if events.is_closed() {
            break;
        }
    }

    events.finish();
    debug!("websocket reader stopped");
}

//! JSON envelopes exchanged with the realtime backend.
//!
//! ## Outbound
//!
//! | Message | Shape |
//! |---------|-------|
//! | session open | `{"setup": {model, generationConfig, systemInstruction, tools}}` |
//! | audio frame | `{"realtimeInput": {"media": {"mimeType": "audio/pcm;rate=16000", "data": <b64>}}}` |
//! | tool response | `{"toolResponse": {"functionResponses": {id, name, "response": {"result": ..}}}}` |
//!
//! ## Inbound
//!
//! `setupComplete`, `serverContent` (audio parts, `turnComplete`,
//! `interrupted`) and `toolCall` (`functionCalls: [{id, name, args}]`).
//! [`parse_server_message`] flattens one message into zero or more
//! [`ConnectionEvent`]s in the order they must be handled.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::buffering::EncodedFrame;
use crate::codec;
use crate::error::{Result, VoxlineError};
use crate::tools::{ToolDeclaration, ToolInvocation, ToolResponse};
use crate::transport::{ConnectionEvent, ResponseModality, SessionConfig};

/// Rate assumed for inbound audio whose MIME type carries none.
pub const DEFAULT_INBOUND_RATE: u32 = 24_000;

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponseBody),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolGroup>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoice,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice {
    voice_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolGroup {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolDeclaration> for FunctionDeclaration {
    fn from(decl: &ToolDeclaration) -> Self {
        Self {
            name: decl.name.clone(),
            description: decl.description.clone(),
            parameters: decl.parameter_schema.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RealtimeInput {
    media: Blob,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponseBody {
    function_responses: FunctionResponse,
}

#[derive(Debug, Serialize)]
struct FunctionResponse {
    id: String,
    name: String,
    response: ResponsePayload,
}

#[derive(Debug, Serialize)]
struct ResponsePayload {
    result: Value,
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<Blob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    tool_call: Option<ToolCall>,
    #[serde(default)]
    go_away: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<Content>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCall {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    args: Value,
}

// ---------------------------------------------------------------------------
// Encoding / decoding
// ---------------------------------------------------------------------------

fn to_json(message: &ClientMessage) -> Result<String> {
    serde_json::to_string(message)
        .map_err(|e| VoxlineError::Codec(format!("serialize client message: {e}")))
}

/// Session-open message for `model`.
pub fn setup_message(model: &str, config: &SessionConfig) -> Result<String> {
    let modality = match config.response_modality {
        ResponseModality::Audio => "AUDIO",
    };
    let tools = if config.tools.is_empty() {
        Vec::new()
    } else {
        vec![ToolGroup {
            function_declarations: config.tools.iter().map(FunctionDeclaration::from).collect(),
        }]
    };
    to_json(&ClientMessage::Setup(Setup {
        model: model.to_string(),
        generation_config: GenerationConfig {
            response_modalities: vec![modality],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoice {
                        voice_name: config.voice_name.clone(),
                    },
                },
            },
        },
        system_instruction: Content {
            parts: vec![Part {
                text: Some(config.system_instruction.clone()),
                inline_data: None,
            }],
        },
        tools,
    }))
}

/// Outbound audio envelope for one frame.
pub fn audio_message(frame: &EncodedFrame) -> Result<String> {
    to_json(&ClientMessage::RealtimeInput(RealtimeInput {
        media: Blob {
            mime_type: frame.mime_type(),
            data: codec::to_base64(&frame.pcm),
        },
    }))
}

/// Outbound envelope answering one tool invocation.
pub fn tool_response_message(response: &ToolResponse) -> Result<String> {
    to_json(&ClientMessage::ToolResponse(ToolResponseBody {
        function_responses: FunctionResponse {
            id: response.id.clone(),
            name: response.name.clone(),
            response: ResponsePayload {
                result: response.result.clone(),
            },
        },
    }))
}

/// Flatten one inbound message into connection events.
///
/// Order within a message: `Opened`, audio chunks, `Interrupted`,
/// `TurnComplete`, `ToolCall`. Undecodable audio parts are skipped with a
/// warning; a message that is not JSON at all is an error.
pub fn parse_server_message(raw: &str) -> Result<Vec<ConnectionEvent>> {
    let message: ServerMessage = serde_json::from_str(raw)
        .map_err(|e| VoxlineError::Codec(format!("invalid server message: {e}")))?;

    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(ConnectionEvent::Opened);
    }

    if let Some(content) = message.server_content {
        let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
        for part in parts {
            let Some(blob) = part.inline_data else {
                if let Some(text) = part.text {
                    debug!(len = text.len(), "ignoring text part in audio session");
                }
                continue;
            };
            if !blob.mime_type.starts_with("audio/") {
                debug!(mime = %blob.mime_type, "ignoring non-audio inline data");
                continue;
            }
            match codec::from_base64(&blob.data) {
                Ok(pcm) => events.push(ConnectionEvent::InboundAudio {
                    pcm,
                    sample_rate: codec::rate_from_mime(&blob.mime_type)
                        .unwrap_or(DEFAULT_INBOUND_RATE),
                }),
                Err(e) => warn!("skipping inbound audio part: {e}"),
            }
        }
        if content.interrupted {
            events.push(ConnectionEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ConnectionEvent::TurnComplete);
        }
    }

    if let Some(call) = message.tool_call {
        let invocations: Vec<_> = call
            .function_calls
            .into_iter()
            .map(|c| ToolInvocation {
                id: c.id,
                name: c.name,
                arguments: c.args,
            })
            .collect();
        if !invocations.is_empty() {
            events.push(ConnectionEvent::ToolCall(invocations));
        }
    }

    if message.go_away.is_some() {
        warn!("backend announced it will close the session soon");
    }

    Ok(events)
}

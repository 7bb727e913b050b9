//! Wire protocol for the remote realtime speech service.
//!
//! Incoming JSON messages are mapped onto a closed [`SessionEvent`] set;
//! anything unrecognized is dropped by the caller after a log line.
//! Outgoing client messages are built here so the socket writer stays a
//! dumb pump.

use base64::Engine as _;
use serde_json::{json, Value};

use crate::tools::{FunctionCallOutput, ToolDescriptor};

/// One item the server reports as created at the end of a response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreatedItem {
    pub function_name: Option<String>,
    pub function_call_id: Option<String>,
    pub message_role: Option<String>,
}

/// Closed set of server events the engine consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionStarted {
        session_id: String,
    },
    OutputStreamingStarted {
        item_id: String,
        function_name: Option<String>,
    },
    OutputDelta {
        item_id: String,
        audio: Option<Vec<u8>>,
        audio_transcript: Option<String>,
        text: Option<String>,
        function_arguments: Option<String>,
        function_call_id: Option<String>,
    },
    OutputStreamingFinished {
        item_id: String,
        function_call_id: Option<String>,
        function_name: Option<String>,
    },
    InputAudioTranscriptionFinished {
        transcript: String,
    },
    ResponseFinished {
        created_items: Vec<CreatedItem>,
    },
    Error {
        message: String,
    },
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Parse one incoming text frame. `None` means an event outside the
/// consumed set (ignored per the remote-protocol error policy).
pub fn parse_server_event(raw: &str) -> Option<SessionEvent> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let event_type = value.get("type")?.as_str()?;

    match event_type {
        "session.created" => Some(SessionEvent::SessionStarted {
            session_id: value
                .get("session")
                .and_then(|s| str_field(s, "id"))
                .unwrap_or_default(),
        }),
        "response.output_item.added" => {
            let item = value.get("item")?;
            Some(SessionEvent::OutputStreamingStarted {
                item_id: str_field(item, "id")?,
                function_name: str_field(item, "name"),
            })
        }
        "response.audio.delta" => {
            let encoded = str_field(&value, "delta")?;
            let audio = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .ok()?;
            Some(SessionEvent::OutputDelta {
                item_id: str_field(&value, "item_id")?,
                audio: Some(audio),
                audio_transcript: None,
                text: None,
                function_arguments: None,
                function_call_id: None,
            })
        }
        "response.audio_transcript.delta" => Some(SessionEvent::OutputDelta {
            item_id: str_field(&value, "item_id")?,
            audio: None,
            audio_transcript: str_field(&value, "delta"),
            text: None,
            function_arguments: None,
            function_call_id: None,
        }),
        "response.text.delta" => Some(SessionEvent::OutputDelta {
            item_id: str_field(&value, "item_id")?,
            audio: None,
            audio_transcript: None,
            text: str_field(&value, "delta"),
            function_arguments: None,
            function_call_id: None,
        }),
        "response.function_call_arguments.delta" => Some(SessionEvent::OutputDelta {
            item_id: str_field(&value, "item_id")?,
            audio: None,
            audio_transcript: None,
            text: None,
            function_arguments: str_field(&value, "delta"),
            function_call_id: str_field(&value, "call_id"),
        }),
        "response.output_item.done" => {
            let item = value.get("item")?;
            Some(SessionEvent::OutputStreamingFinished {
                item_id: str_field(item, "id")?,
                function_call_id: str_field(item, "call_id"),
                function_name: str_field(item, "name"),
            })
        }
        "conversation.item.input_audio_transcription.completed" => {
            Some(SessionEvent::InputAudioTranscriptionFinished {
                transcript: str_field(&value, "transcript").unwrap_or_default(),
            })
        }
        "response.done" => {
            let created_items = value
                .get("response")
                .and_then(|r| r.get("output"))
                .and_then(|o| o.as_array())
                .map(|items| {
                    items
                        .iter()
                        .map(|item| CreatedItem {
                            function_name: str_field(item, "name"),
                            function_call_id: str_field(item, "call_id"),
                            message_role: str_field(item, "role"),
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(SessionEvent::ResponseFinished { created_items })
        }
        "error" => Some(SessionEvent::Error {
            message: value
                .get("error")
                .and_then(|e| str_field(e, "message"))
                .unwrap_or_else(|| "unknown server error".to_string()),
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Outgoing client messages
// ---------------------------------------------------------------------------

/// Client-generated id correlating server acks and errors to the frame
/// that caused them.
fn event_id() -> String {
    format!("evt_{}", uuid::Uuid::new_v4().simple())
}

/// Session configuration applied right after connect.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub voice: String,
    pub instructions: String,
    pub temperature: Option<f32>,
    pub tools: Vec<ToolDescriptor>,
}

/// `session.update`: voice, instructions, PCM16 both ways, server VAD
/// off, tools advertised with tool_choice=auto.
pub fn session_update(setup: &SessionSetup) -> String {
    let tools: Vec<Value> = setup
        .tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })
        })
        .collect();

    let mut session = json!({
        "voice": setup.voice,
        "instructions": setup.instructions,
        "input_audio_format": "pcm16",
        "output_audio_format": "pcm16",
        "turn_detection": Value::Null,
        "tools": tools,
        "tool_choice": "auto",
    });
    if let Some(t) = setup.temperature {
        session["temperature"] = json!(t);
    }

    json!({ "type": "session.update", "event_id": event_id(), "session": session }).to_string()
}

pub fn input_audio_append(audio: &[u8]) -> String {
    json!({
        "type": "input_audio_buffer.append",
        "event_id": event_id(),
        "audio": base64::engine::general_purpose::STANDARD.encode(audio),
    })
    .to_string()
}

pub fn input_audio_commit() -> String {
    json!({ "type": "input_audio_buffer.commit", "event_id": event_id() }).to_string()
}

pub fn response_create() -> String {
    json!({ "type": "response.create", "event_id": event_id() }).to_string()
}

pub fn response_cancel() -> String {
    json!({ "type": "response.cancel", "event_id": event_id() }).to_string()
}

pub fn item_truncate(item_id: &str, content_index: u32, audio_end_ms: u64) -> String {
    json!({
        "type": "conversation.item.truncate",
        "event_id": event_id(),
        "item_id": item_id,
        "content_index": content_index,
        "audio_end_ms": audio_end_ms,
    })
    .to_string()
}

pub fn function_output_item(output: &FunctionCallOutput) -> String {
    json!({
        "type": "conversation.item.create",
        "event_id": event_id(),
        "item": {
            "type": "function_call_output",
            "call_id": output.call_id,
            "output": output.output,
        },
    })
    .to_string()
}

/// OpenAI Realtime API wire-format events (the subset the bridge speaks).
///
/// Client events travel bridge → model; server events travel model → bridge.
/// Both are discriminated by the `type` field. Shapes follow the published
/// Realtime API; unknown server event types fall into `Unknown` so new model
/// releases cannot break the reader loop.
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────
//  Session configuration
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    pub tool_choice: String,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioTranscription {
    pub model: String,
}

/// Server-side turn detection preferences.
///
/// `create_response` decides the response-creation policy for the whole
/// call: when true the model auto-creates responses on commit and the
/// bridge never sends `response.create`; when false the bridge drives
/// response creation explicitly. The two modes are exclusive.
#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub create_response: bool,
}

// ─────────────────────────────────────────────────────────────────────
//  Conversation items
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ConversationItem {
    /// A `function_call_output` item carrying a JSON-serialized result.
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        ConversationItem {
            kind: "function_call_output".into(),
            call_id: Some(call_id.into()),
            output: Some(output.into()),
            role: None,
            content: None,
        }
    }

    /// A plain user text message (used to surface DTMF key presses).
    pub fn user_text(text: impl Into<String>) -> Self {
        ConversationItem {
            kind: "message".into(),
            call_id: None,
            output: None,
            role: Some("user".into()),
            content: Some(vec![ContentPart {
                kind: "input_text".into(),
                text: text.into(),
            }]),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
//  Client events: bridge → model
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::InputAudioBufferClear => "input_audio_buffer.clear",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate => "response.create",
            ClientEvent::ResponseCancel => "response.cancel",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
//  Server events: model → bridge
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    /// Server-side faults terminate the bridge; request-level errors do not.
    pub fn is_fatal(&self) -> bool {
        self.kind.as_deref() == Some("server_error")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    ResponseAudioDone {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta { delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    ResponseAudioTranscriptDone { transcript: String },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
        #[serde(default)]
        output_item_id: Option<String>,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.cancelled")]
    ResponseCancelled {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Any event type this bridge does not consume.
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::SessionCreated { .. } => "session.created",
            ServerEvent::SessionUpdated { .. } => "session.updated",
            ServerEvent::InputAudioBufferCommitted { .. } => "input_audio_buffer.committed",
            ServerEvent::SpeechStarted => "input_audio_buffer.speech_started",
            ServerEvent::SpeechStopped => "input_audio_buffer.speech_stopped",
            ServerEvent::ResponseCreated { .. } => "response.created",
            ServerEvent::ResponseAudioDelta { .. } => "response.audio.delta",
            ServerEvent::ResponseAudioDone { .. } => "response.audio.done",
            ServerEvent::ResponseAudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            ServerEvent::ResponseAudioTranscriptDone { .. } => "response.audio_transcript.done",
            ServerEvent::InputTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            ServerEvent::FunctionCallArgumentsDelta { .. } => {
                "response.function_call_arguments.delta"
            }
            ServerEvent::FunctionCallArgumentsDone { .. } => {
                "response.function_call_arguments.done"
            }
            ServerEvent::ResponseDone { .. } => "response.done",
            ServerEvent::ResponseCancelled { .. } => "response.cancelled",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Unknown => "unknown",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

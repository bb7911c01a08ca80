//! Wire protocol between relay clients and the relay server.
//!
//! Every frame is one JSON object with a mandatory `type` tag. Frames may
//! carry an optional top-level `id`; the server copies it onto the reply so
//! clients can match responses to requests.

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Greeting sent as the first frame on every accepted connection.
pub const CONNECTED_MESSAGE: &str = "Successfully connected to WebSocket server";

/// Error text for frames that cannot be parsed.
pub const MALFORMED_FRAME_ERROR: &str = "Failed to process message";

/// Client -> server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    StartRecording,
    StopRecording,
    ProcessText {
        text: String,
    },
    ProcessMultimodal {
        text: String,
        #[serde(rename = "imageData")]
        image_data: String,
    },
    /// Reserved for streamed audio; accepted and ignored.
    AudioData {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk: Option<Value>,
    },
    /// Any `type` this server does not know.
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::StartRecording => "START_RECORDING",
            ClientMessage::StopRecording => "STOP_RECORDING",
            ClientMessage::ProcessText { .. } => "PROCESS_TEXT",
            ClientMessage::ProcessMultimodal { .. } => "PROCESS_MULTIMODAL",
            ClientMessage::AudioData { .. } => "AUDIO_DATA",
            ClientMessage::Unknown => "UNKNOWN",
        }
    }
}

/// Server -> client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Connected { message: String },
    RecordingStarted,
    RecordingStopped,
    GeminiResponse { response: String },
    Error { error: String },
}

impl ServerMessage {
    pub fn connected() -> Self {
        ServerMessage::Connected {
            message: CONNECTED_MESSAGE.to_string(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "CONNECTED",
            ServerMessage::RecordingStarted => "RECORDING_STARTED",
            ServerMessage::RecordingStopped => "RECORDING_STOPPED",
            ServerMessage::GeminiResponse { .. } => "GEMINI_RESPONSE",
            ServerMessage::Error { .. } => "ERROR",
        }
    }
}

/// A frame that can be written to the socket.
pub trait WireFrame: Send + 'static {
    /// Value of the frame's `type` tag.
    fn kind(&self) -> &'static str;

    fn to_text(&self) -> serde_json::Result<String>;
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("missing or non-string `type` field")]
    MissingType,

    #[error("invalid {kind} frame: {source}")]
    InvalidFields {
        kind: String,
        id: Option<String>,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid base64 image data: {0}")]
    InvalidImage(#[from] base64::DecodeError),
}

impl FrameError {
    /// Correlation id of the offending frame, when it could be read.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            FrameError::InvalidFields { id, .. } => id.as_deref(),
            _ => None,
        }
    }
}

/// Split a frame into its correlation id, its `type` tag and the object.
fn split_envelope(text: &str) -> Result<(Option<String>, String, Value), FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let object = value.as_object().ok_or(FrameError::NotAnObject)?;
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();
    let id = object.get("id").and_then(Value::as_str).map(str::to_string);
    Ok((id, kind, value))
}

/// Attach a correlation id to an already serialized message.
fn to_text<T: Serialize>(id: Option<&str>, message: &T) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(message)?;
    if let (Some(id), Value::Object(map)) = (id, &mut value) {
        map.insert("id".to_string(), Value::String(id.to_string()));
    }
    serde_json::to_string(&value)
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub id: Option<String>,
    pub message: ClientMessage,
}

impl InboundFrame {
    pub fn new(id: Option<String>, message: ClientMessage) -> Self {
        Self { id, message }
    }

    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let (id, kind, value) = split_envelope(text)?;
        let message = serde_json::from_value(value).map_err(|source| FrameError::InvalidFields {
            kind,
            id: id.clone(),
            source,
        })?;
        Ok(Self { id, message })
    }
}

impl WireFrame for InboundFrame {
    fn kind(&self) -> &'static str {
        self.message.kind()
    }

    fn to_text(&self) -> serde_json::Result<String> {
        to_text(self.id.as_deref(), &self.message)
    }
}

/// A server frame, optionally correlated to the request it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub id: Option<String>,
    pub message: ServerMessage,
}

impl OutboundFrame {
    pub fn new(id: Option<String>, message: ServerMessage) -> Self {
        Self { id, message }
    }

    /// An uncorrelated frame.
    pub fn broadcast(message: ServerMessage) -> Self {
        Self { id: None, message }
    }

    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let (id, kind, value) = split_envelope(text)?;
        let message = serde_json::from_value(value).map_err(|source| FrameError::InvalidFields {
            kind,
            id: id.clone(),
            source,
        })?;
        Ok(Self { id, message })
    }
}

impl WireFrame for OutboundFrame {
    fn kind(&self) -> &'static str {
        self.message.kind()
    }

    fn to_text(&self) -> serde_json::Result<String> {
        to_text(self.id.as_deref(), &self.message)
    }
}

/// Decode the `imageData` field of a multimodal frame.
///
/// Accepts plain base64 or a `data:<mime>;base64,` URL as produced by
/// browser canvases.
pub fn decode_image_data(image_data: &str) -> Result<Vec<u8>, FrameError> {
    let payload = match image_data.split_once(";base64,") {
        Some((prefix, payload)) if prefix.starts_with("data:") => payload,
        _ => image_data,
    };
    Ok(general_purpose::STANDARD.decode(payload.trim())?)
}

/// Encode raw image bytes for the `imageData` field.
pub fn encode_image_data(image: &[u8]) -> String {
    general_purpose::STANDARD.encode(image)
}

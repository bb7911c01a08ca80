//! Gemini REST API types
//!
//! Request/response shapes for the `generateContent` endpoint, the client
//! configuration and the error type shared by the provider client.

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Base URL of the public Gemini REST API.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Chat-oriented model used for plain text requests.
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.0-pro-exp-02-05";

/// Vision model used for text + image requests.
pub const DEFAULT_VISION_MODEL: &str = "gemini-2.0-pro-vision";

/// MIME type attached to every inlined image.
pub const IMAGE_MIME_TYPE: &str = "image/jpeg";


/// Generation parameters sent with every request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: 2048,
            temperature: 0.7,
            top_p: 0.8,
            top_k: 40,
        }
    }
}

/// Inline binary payload (base64 encoded on the wire).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

/// One part of a content block: either text or inline data.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    pub fn jpeg(bytes: &[u8]) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: IMAGE_MIME_TYPE.to_string(),
                data: general_purpose::STANDARD.encode(bytes),
            }),
        }
    }
}

/// A single conversation turn.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    /// A user turn holding only text.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![Part::text(text)],
        }
    }

    /// A user turn holding text followed by a JPEG image.
    pub fn user_text_and_image(text: impl Into<String>, image: &[u8]) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![Part::text(text), Part::jpeg(image)],
        }
    }
}

/// Body of a `models/{model}:generateContent` call.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

impl GenerateContentRequest {
    pub fn new(contents: Vec<Content>, generation_config: GenerationConfig) -> Self {
        Self {
            contents,
            generation_config: Some(generation_config),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

/// Successful `generateContent` response.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
}

impl GenerateContentResponse {
    /// Unwrap the text output of the first candidate.
    pub fn into_text(self) -> Result<String> {
        if let Some(reason) = self
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
        {
            return Err(GeminiError::Blocked(reason));
        }

        let text: String = self
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();

        if text.is_empty() {
            Err(GeminiError::EmptyResponse)
        } else {
            Ok(text)
        }
    }
}

/// Error envelope returned by the API on non-2xx responses.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Error type for Gemini API operations
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Prompt blocked: {0}")]
    Blocked(String),

    #[error("Response contained no text")]
    EmptyResponse,

    #[error("API key is not a valid header value")]
    InvalidApiKey,
}

pub type Result<T> = std::result::Result<T, GeminiError>;

/// Configuration for the Gemini client
#[derive(Debug, Clone)]
pub struct GeminiClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub text_model: String,
    pub vision_model: String,
    pub generation_config: GenerationConfig,
}

impl Default for GeminiClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            generation_config: GenerationConfig::default(),
        }
    }
}

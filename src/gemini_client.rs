//! Gemini provider client
//!
//! Wraps the two preconfigured model handles (text and vision) behind the
//! [`Provider`] trait the relay dispatches to. Every call is a fresh
//! single-turn request; nothing is retried.

use crate::gemini::{
    ApiErrorBody, Content, GeminiClientConfig, GeminiError, GenerateContentRequest,
    GenerateContentResponse, Result,
};

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use tracing::{debug, error, info};

/// Generative backend the relay forwards requests to.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human readable provider name, used in error frames.
    fn name(&self) -> &str;

    /// Run a single-turn text request and return the model's text output.
    async fn process_text(&self, text: &str) -> Result<String>;

    /// Run a text + JPEG image request and return the model's text output.
    async fn process_multimodal(&self, text: &str, image: &[u8]) -> Result<String>;
}

/// Header carrying the API key. Kept out of the URL so transport errors,
/// which print the URL, never contain the key.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// HTTP client for the Gemini `generateContent` endpoint.
pub struct GeminiClient {
    config: GeminiClientConfig,
    http: reqwest::Client,
}

impl GeminiClient {
    /// Create a new Gemini client with the given configuration.
    pub fn new(config: GeminiClientConfig) -> Self {
        info!(
            "Gemini client ready (text model: {}, vision model: {})",
            config.text_model, config.vision_model
        );
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Create a new Gemini client from an API key and optional configuration.
    pub fn from_api_key(api_key: &str, config: Option<GeminiClientConfig>) -> Self {
        let mut config = config.unwrap_or_default();
        config.api_key = api_key.to_string();
        Self::new(config)
    }

    pub fn config(&self) -> &GeminiClientConfig {
        &self.config
    }

    fn endpoint(&self, model: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        )
    }

    async fn generate(&self, model: &str, content: Content) -> Result<String> {
        let request =
            GenerateContentRequest::new(vec![content], self.config.generation_config.clone());

        let mut api_key = HeaderValue::from_str(&self.config.api_key)
            .map_err(|_| GeminiError::InvalidApiKey)?;
        api_key.set_sensitive(true);

        debug!("POST generateContent (model: {})", model);
        let response = self
            .http
            .post(self.endpoint(model))
            .header(API_KEY_HEADER, api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let message = serde_json::from_slice::<ApiErrorBody>(&body)
                .map(|body| body.error.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
            error!("Gemini API returned {}: {}", status, message);
            return Err(GeminiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateContentResponse = serde_json::from_slice(&body)?;
        parsed.into_text()
    }
}

#[async_trait]
impl Provider for GeminiClient {
    fn name(&self) -> &str {
        "Gemini"
    }

    async fn process_text(&self, text: &str) -> Result<String> {
        info!("💬 Processing text with {}", self.config.text_model);
        let output = self
            .generate(&self.config.text_model, Content::user_text(text))
            .await?;
        info!("✅ Received response from {}", self.config.text_model);
        Ok(output)
    }

    async fn process_multimodal(&self, text: &str, image: &[u8]) -> Result<String> {
        info!(
            "📸 Processing multimodal input with {} ({} KB image)",
            self.config.vision_model,
            image.len() / 1024
        );
        let output = self
            .generate(
                &self.config.vision_model,
                Content::user_text_and_image(text, image),
            )
            .await?;
        info!("✅ Received multimodal response from {}", self.config.vision_model);
        Ok(output)
    }
}

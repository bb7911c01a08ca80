//! Request/response flows layered over a [`RelayConnection`].
//!
//! [`GeminiSession`] sends processing requests and tracks the last response,
//! the last error and whether a request is in flight. [`VoiceRecording`]
//! sends recording control frames and tracks the recording flag.

use crate::client::{ClientError, RelayConnection, NOT_CONNECTED_ERROR};
use crate::events::{encode_image_data, ClientMessage, ServerMessage};

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The relay answered with an `ERROR` frame.
    #[error("{0}")]
    Server(String),

    #[error("unexpected {0} reply")]
    UnexpectedReply(&'static str),
}

/// Observable state of a [`GeminiSession`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingState {
    pub response: Option<String>,
    pub error: Option<String>,
    /// Requests sent and not yet answered.
    pub in_flight: usize,
}

impl ProcessingState {
    pub fn is_processing(&self) -> bool {
        self.in_flight > 0
    }
}

/// Text and multimodal processing flow.
pub struct GeminiSession {
    connection: Arc<RelayConnection>,
    state: watch::Sender<ProcessingState>,
}

impl GeminiSession {
    pub fn new(connection: Arc<RelayConnection>) -> Self {
        let (state, _) = watch::channel(ProcessingState::default());
        Self { connection, state }
    }

    pub fn state(&self) -> ProcessingState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ProcessingState> {
        self.state.subscribe()
    }

    pub fn response(&self) -> Option<String> {
        self.state.borrow().response.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn is_processing(&self) -> bool {
        self.state.borrow().is_processing()
    }

    pub async fn process_text(&self, text: &str) -> Result<String, HookError> {
        info!("Sending text to process: {}", text.chars().take(50).collect::<String>());
        self.run(ClientMessage::ProcessText {
            text: text.to_string(),
        })
        .await
    }

    pub async fn process_multimodal(&self, text: &str, image: &[u8]) -> Result<String, HookError> {
        info!("Sending multimodal data to process ({} KB image)", image.len() / 1024);
        self.run(ClientMessage::ProcessMultimodal {
            text: text.to_string(),
            image_data: encode_image_data(image),
        })
        .await
    }

    async fn run(&self, message: ClientMessage) -> Result<String, HookError> {
        if !self.connection.is_connected() {
            error!("Cannot process {}: WebSocket not connected", message.kind());
            self.state
                .send_modify(|state| state.error = Some(NOT_CONNECTED_ERROR.to_string()));
            return Err(ClientError::NotConnected.into());
        }

        let _in_flight = InFlight::start(&self.state);
        let result = match self.connection.request(message).await {
            Ok(ServerMessage::GeminiResponse { response }) => Ok(response),
            Ok(ServerMessage::Error { error }) => Err(HookError::Server(error)),
            Ok(other) => Err(HookError::UnexpectedReply(other.kind())),
            Err(e) => Err(HookError::Client(e)),
        };

        self.state.send_modify(|state| match &result {
            Ok(response) => {
                state.response = Some(response.clone());
                state.error = None;
            }
            Err(e) => {
                error!("Received error from server: {}", e);
                state.error = Some(e.to_string());
            }
        });
        result
    }
}

/// Marks one request in flight until dropped.
struct InFlight<'a> {
    state: &'a watch::Sender<ProcessingState>,
}

impl<'a> InFlight<'a> {
    fn start(state: &'a watch::Sender<ProcessingState>) -> Self {
        state.send_modify(|state| state.in_flight += 1);
        Self { state }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state
            .send_modify(|state| state.in_flight = state.in_flight.saturating_sub(1));
    }
}

/// Observable state of a [`VoiceRecording`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingState {
    pub is_recording: bool,
    pub error: Option<String>,
}

/// Recording start/stop flow. The flag flips as soon as the control frame
/// is sent; acknowledgements are not awaited.
pub struct VoiceRecording {
    connection: Arc<RelayConnection>,
    state: watch::Sender<RecordingState>,
}

impl VoiceRecording {
    pub fn new(connection: Arc<RelayConnection>) -> Self {
        let (state, _) = watch::channel(RecordingState::default());
        Self { connection, state }
    }

    pub fn state(&self) -> RecordingState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RecordingState> {
        self.state.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.state.borrow().is_recording
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn start_recording(&self) -> Result<(), ClientError> {
        info!("Starting recording...");
        self.toggle(ClientMessage::StartRecording, true, "Failed to start recording")
    }

    pub fn stop_recording(&self) -> Result<(), ClientError> {
        info!("Stopping recording...");
        self.toggle(ClientMessage::StopRecording, false, "Failed to stop recording")
    }

    fn toggle(
        &self,
        message: ClientMessage,
        recording: bool,
        failure: &str,
    ) -> Result<(), ClientError> {
        if !self.connection.is_connected() {
            error!("Cannot send {}: WebSocket not connected", message.kind());
            self.state
                .send_modify(|state| state.error = Some(NOT_CONNECTED_ERROR.to_string()));
            return Err(ClientError::NotConnected);
        }

        match self.connection.send(message) {
            Ok(()) => {
                self.state.send_modify(|state| {
                    state.is_recording = recording;
                    state.error = None;
                });
                Ok(())
            }
            Err(e) => {
                error!("{}: {}", failure, e);
                self.state
                    .send_modify(|state| state.error = Some(failure.to_string()));
                Err(e)
            }
        }
    }
}

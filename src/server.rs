//! Relay server
//!
//! Accepts WebSocket clients, answers control frames directly and forwards
//! processing requests to a [`Provider`]. Each connection runs three tasks:
//! the reader (this handler), a worker draining the connection's request
//! queue so at most one provider call is in flight per connection, and the
//! writer that owns the socket sink.

use crate::events::{
    decode_image_data, ClientMessage, InboundFrame, OutboundFrame, ServerMessage,
    MALFORMED_FRAME_ERROR,
};
use crate::gemini_client::Provider;
use crate::registry::ConnectionRegistry;
use crate::ws_writer::run_writer;

use anyhow::Result;
use futures_util::StreamExt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;

/// How long the writer gets to flush the close handshake after disconnect.
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
        }
    }
}

pub struct RelayServer {
    listener: TcpListener,
    provider: Arc<dyn Provider>,
    registry: ConnectionRegistry,
}

impl RelayServer {
    /// Bind the listening socket.
    pub async fn bind(config: &RelayConfig, provider: Arc<dyn Provider>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        Ok(Self {
            listener,
            provider,
            registry: ConnectionRegistry::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to this server's live connections.
    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    /// Serve until the process exits.
    pub async fn run(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Connections already accepted keep
    /// running on their own tasks.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("WebSocket Server is running on ws://{}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let provider = self.provider.clone();
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, provider, registry).await {
                            warn!("Connection error from {}: {}", peer, e);
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    provider: Arc<dyn Provider>,
    registry: ConnectionRegistry,
) -> Result<()> {
    let ws = accept_async(stream).await?;
    let (sink, mut stream) = ws.split();

    let registration = registry.register(peer);
    info!("New client connected: {} (connection {})", peer, registration.id());

    let (out_tx, out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let mut writer = tokio::spawn(run_writer(out_rx, sink));
    let _ = out_tx.send(OutboundFrame::broadcast(ServerMessage::connected()));

    // The reader never waits on the worker, so a close or transport error is
    // seen even while a provider call is still running.
    let (job_tx, job_rx) = mpsc::unbounded_channel::<String>();
    let worker = tokio::spawn(run_worker(provider, job_rx, out_tx));

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Message::Close(frame)) => {
                debug!("Close frame from {}: {:?}", peer, frame);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket error from {}: {}", peer, e);
                break;
            }
        };

        if job_tx.send(text).is_err() {
            break;
        }
    }

    info!("Client disconnected: {} (connection {})", peer, registration.id());
    drop(registration);

    // Cancelling the worker drops the last frame sender, so the writer drains,
    // flushes the close reply and exits on its own.
    worker.abort();
    let _ = worker.await;
    if tokio::time::timeout(WRITER_SHUTDOWN_GRACE, &mut writer)
        .await
        .is_err()
    {
        debug!("Writer for {} did not finish in time", peer);
        writer.abort();
    }
    Ok(())
}

async fn run_worker(
    provider: Arc<dyn Provider>,
    mut jobs: mpsc::UnboundedReceiver<String>,
    out_tx: mpsc::UnboundedSender<OutboundFrame>,
) {
    while let Some(text) = jobs.recv().await {
        if let Some(reply) = handle_frame(provider.as_ref(), &text).await {
            if out_tx.send(reply).is_err() {
                break;
            }
        }
    }
}

/// Process one raw client frame and produce the reply, if any.
pub async fn handle_frame(provider: &dyn Provider, text: &str) -> Option<OutboundFrame> {
    let InboundFrame { id, message } = match InboundFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            error!("Error processing message: {}", e);
            let id = e.correlation_id().map(str::to_string);
            return Some(OutboundFrame::new(
                id,
                ServerMessage::error(MALFORMED_FRAME_ERROR),
            ));
        }
    };

    debug!("Received: {}", message.kind());

    let reply = match message {
        ClientMessage::StartRecording => {
            info!("🎙️ Client started recording");
            ServerMessage::RecordingStarted
        }
        ClientMessage::StopRecording => {
            info!("🎙️ Client stopped recording");
            ServerMessage::RecordingStopped
        }
        ClientMessage::ProcessText { text } => {
            info!(
                "💬 Processing text with {}: {}",
                provider.name(),
                text.chars().take(50).collect::<String>()
            );
            match provider.process_text(&text).await {
                Ok(response) => ServerMessage::GeminiResponse { response },
                Err(e) => {
                    error!("Error processing text: {}", e);
                    ServerMessage::error(format!("Failed to process text with {}", provider.name()))
                }
            }
        }
        ClientMessage::ProcessMultimodal { text, image_data } => {
            let image = match decode_image_data(&image_data) {
                Ok(image) => image,
                Err(e) => {
                    error!("Error processing message: {}", e);
                    return Some(OutboundFrame::new(
                        id,
                        ServerMessage::error(MALFORMED_FRAME_ERROR),
                    ));
                }
            };

            info!("📸 Processing multimodal data with {}", provider.name());
            match provider.process_multimodal(&text, &image).await {
                Ok(response) => ServerMessage::GeminiResponse { response },
                Err(e) => {
                    error!("Error processing multimodal data: {}", e);
                    ServerMessage::error(format!(
                        "Failed to process multimodal data with {}",
                        provider.name()
                    ))
                }
            }
        }
        ClientMessage::AudioData { .. } => {
            debug!("🎵 Received audio data chunk (ignored)");
            return None;
        }
        ClientMessage::Unknown => {
            warn!(
                "Unknown message type: {}",
                text.chars().take(100).collect::<String>()
            );
            return None;
        }
    };

    Some(OutboundFrame::new(id, reply))
}

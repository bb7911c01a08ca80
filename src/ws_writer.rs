//! WebSocket writer task that serializes and sends all outgoing frames
//! This is the single point where a connection's frames are serialized to JSON

use crate::events::WireFrame;
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info};

/// Run the websocket writer task until the channel closes or a send fails.
pub async fn run_writer<F, S>(mut outgoing_rx: UnboundedReceiver<F>, mut sink: S)
where
    F: WireFrame,
    S: Sink<Message, Error = WsError> + Unpin,
{
    debug!("WebSocket writer task started");

    while let Some(frame) = outgoing_rx.recv().await {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize {} frame: {}", frame.kind(), e);
                continue;
            }
        };

        debug!("📤 Sending {} frame", frame.kind());
        if let Err(e) = sink.send(Message::text(text)).await {
            error!("Failed to send to websocket: {}", e);
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!("WebSocket close after writer shutdown failed: {}", e);
    }
    info!("WebSocket writer task shutting down");
}

//! Client side connection manager for the relay.
//!
//! Holds one WebSocket to the relay server. Requests sent through
//! [`RelayConnection::request`] carry a fresh correlation id and are resolved
//! by the matching reply only; uncorrelated frames (the greeting, recording
//! acknowledgements) go to [`RelayConnection::subscribe`] receivers. The
//! first receiver handed out exists from before the reader starts, so it
//! always sees the `CONNECTED` greeting.
//! Dropping the connection tears it down. It never reconnects.

use crate::events::{ClientMessage, InboundFrame, OutboundFrame, ServerMessage};
use crate::ws_writer::run_writer;

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error shown while no connection is open.
pub const NOT_CONNECTED_ERROR: &str = "WebSocket not connected";

/// Error shown when the connection cannot be established or fails.
pub const CONNECTION_FAILED_ERROR: &str = "Failed to connect to WebSocket server";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to WebSocket server: {0}")]
    Connect(#[source] WsError),

    #[error("WebSocket not connected")]
    NotConnected,

    #[error("Connection closed before a response arrived")]
    ConnectionClosed,
}

/// Observable state of the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub error: Option<String>,
}

/// Requests waiting for their reply. `None` once the reader has stopped.
type PendingMap = Arc<Mutex<Option<HashMap<String, oneshot::Sender<ServerMessage>>>>>;

pub struct RelayConnection {
    out_tx: Option<mpsc::UnboundedSender<InboundFrame>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    events_tx: broadcast::Sender<ServerMessage>,
    /// Receiver created before the reader task, handed to the first subscriber.
    first_events: Mutex<Option<broadcast::Receiver<ServerMessage>>>,
    pending: PendingMap,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl RelayConnection {
    /// Connect to the relay at `url` (e.g. `ws://localhost:8080`).
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        info!("Attempting to connect to WebSocket server at {}", url);

        let (ws, _response) = connect_async(url).await.map_err(|e| {
            error!("WebSocket error: {}", e);
            ClientError::Connect(e)
        })?;
        let (sink, stream) = ws.split();

        let (out_tx, out_rx) = mpsc::unbounded_channel::<InboundFrame>();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            connected: true,
            error: None,
        });
        let (events_tx, first_events) = broadcast::channel(64);
        let pending: PendingMap = Arc::new(Mutex::new(Some(HashMap::new())));

        let writer = tokio::spawn(run_writer(out_rx, sink));
        let reader = tokio::spawn(run_reader(
            stream,
            status_tx,
            events_tx.clone(),
            pending.clone(),
        ));

        info!("Connected to WebSocket server");
        Ok(Self {
            out_tx: Some(out_tx),
            status_rx,
            events_tx,
            first_events: Mutex::new(Some(first_events)),
            pending,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status_rx.borrow().connected
    }

    pub fn last_error(&self) -> Option<String> {
        self.status_rx.borrow().error.clone()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Stream of server frames that were not replies to a request.
    ///
    /// The first call returns a receiver that has been buffering since the
    /// connection opened, greeting included. Later calls only see frames that
    /// arrive after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.first_events
            .lock()
            .take()
            .unwrap_or_else(|| self.events_tx.subscribe())
    }

    fn enqueue(&self, frame: InboundFrame) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let out_tx = self.out_tx.as_ref().ok_or(ClientError::NotConnected)?;
        out_tx.send(frame).map_err(|_| ClientError::NotConnected)
    }

    /// Fire-and-forget send; any reply arrives on [`subscribe`](Self::subscribe).
    pub fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        debug!("Sending {} frame", message.kind());
        self.enqueue(InboundFrame::new(None, message))
    }

    /// Send `message` and wait for the reply carrying the same correlation id.
    pub async fn request(&self, message: ClientMessage) -> Result<ServerMessage, ClientError> {
        let id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();

        match self.pending.lock().as_mut() {
            Some(pending) => {
                pending.insert(id.clone(), reply_tx);
            }
            None => return Err(ClientError::NotConnected),
        }
        let _guard = PendingGuard {
            id: id.clone(),
            pending: &self.pending,
        };

        debug!("Sending {} request {}", message.kind(), id);
        self.enqueue(InboundFrame::new(Some(id), message))?;

        reply_rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Close the connection gracefully and wait for both tasks to finish.
    pub async fn close(mut self) {
        info!("Closing connection to WebSocket server");
        // Dropping the sender lets the writer flush and send a close frame.
        self.out_tx.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        if let Some(mut reader) = self.reader.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut reader)
                .await
                .is_err()
            {
                reader.abort();
            }
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Removes an abandoned request from the pending map.
struct PendingGuard<'a> {
    id: String,
    pending: &'a PendingMap,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.lock().as_mut() {
            pending.remove(&self.id);
        }
    }
}

async fn run_reader<S>(
    mut stream: S,
    status_tx: watch::Sender<ConnectionStatus>,
    events_tx: broadcast::Sender<ServerMessage>,
    pending: PendingMap,
) where
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut failure = None;

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Message::Close(frame)) => {
                debug!("Server closed the connection: {:?}", frame);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("WebSocket error: {}", e);
                failure = Some(e);
                break;
            }
        };

        let frame = match OutboundFrame::parse(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Ignoring unreadable frame from server: {}", e);
                continue;
            }
        };

        let waiter = frame
            .id
            .as_ref()
            .and_then(|id| pending.lock().as_mut().and_then(|p| p.remove(id)));

        match waiter {
            Some(reply_tx) => {
                let _ = reply_tx.send(frame.message);
            }
            None => {
                debug!("📥 Received {} frame", frame.message.kind());
                let _ = events_tx.send(frame.message);
            }
        }
    }

    info!("Disconnected from WebSocket server");
    status_tx.send_modify(|status| {
        status.connected = false;
        if failure.is_some() {
            status.error = Some(CONNECTION_FAILED_ERROR.to_string());
        }
    });
    // Dropping the waiters fails their requests with `ConnectionClosed`.
    pending.lock().take();
}

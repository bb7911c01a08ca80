//! End-to-end tests against a relay server on a random local port.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use geminirelay::gemini::{GeminiError, Result as GeminiResult};
use geminirelay::{
    ConnectionRegistry, GeminiSession, Provider, RelayConfig, RelayConnection, RelayServer,
    ServerMessage,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Behavior {
    Reply(&'static str),
    Fail,
    /// Echo the prompt after a delay.
    SlowEcho(Duration),
}

struct MockProvider {
    behavior: Behavior,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockProvider {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    async fn answer(&self, text: &str) -> GeminiResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let result = match &self.behavior {
            Behavior::Reply(reply) => Ok(reply.to_string()),
            Behavior::Fail => Err(GeminiError::Api {
                status: 401,
                message: "API key not valid".to_string(),
            }),
            Behavior::SlowEcho(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(text.to_string())
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "Gemini"
    }

    async fn process_text(&self, text: &str) -> GeminiResult<String> {
        self.answer(text).await
    }

    async fn process_multimodal(&self, text: &str, _image: &[u8]) -> GeminiResult<String> {
        self.answer(text).await
    }
}

async fn start_server(provider: Arc<MockProvider>) -> (SocketAddr, ConnectionRegistry) {
    let config = RelayConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
    };
    let server = RelayServer::bind(&config, provider).await.unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    tokio::spawn(server.run());
    (addr, registry)
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    socket
}

/// Connect and consume the greeting.
async fn connect_ready(addr: SocketAddr) -> Socket {
    let mut socket = connect(addr).await;
    let greeting = recv_json(&mut socket).await;
    assert_eq!(greeting["type"], "CONNECTED");
    socket
}

async fn send_text(socket: &mut Socket, text: &str) {
    socket.send(Message::text(text.to_string())).await.unwrap();
}

async fn recv_json(socket: &mut Socket) -> Value {
    let next = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    })
    .await;
    next.expect("timed out waiting for a frame")
}

/// Assert nothing arrives within `wait`.
async fn assert_silent(socket: &mut Socket, wait: Duration) {
    if let Ok(frame) = tokio::time::timeout(wait, socket.next()).await {
        panic!("expected no frame, got {:?}", frame);
    }
}

async fn wait_for_len(registry: &ConnectionRegistry, expected: usize) {
    wait_for_len_within(registry, expected, Duration::from_secs(5)).await;
}

async fn wait_for_len_within(registry: &ConnectionRegistry, expected: usize, within: Duration) {
    tokio::time::timeout(within, async {
        while registry.len() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry never reached the expected size");
}

#[tokio::test]
async fn first_frame_is_connected_greeting() {
    let (addr, _) = start_server(MockProvider::new(Behavior::Reply("unused"))).await;
    let mut socket = connect(addr).await;

    let greeting = recv_json(&mut socket).await;
    assert_eq!(
        greeting,
        json!({"type": "CONNECTED", "message": "Successfully connected to WebSocket server"})
    );
}

#[tokio::test]
async fn process_text_relays_provider_response() {
    let provider = MockProvider::new(Behavior::Reply("hello"));
    let (addr, _) = start_server(provider.clone()).await;
    let mut socket = connect_ready(addr).await;

    send_text(&mut socket, r#"{"type":"PROCESS_TEXT","text":"hi"}"#).await;
    let reply = recv_json(&mut socket).await;
    assert_eq!(reply, json!({"type": "GEMINI_RESPONSE", "response": "hello"}));

    assert_silent(&mut socket, Duration::from_millis(200)).await;
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn process_multimodal_relays_provider_response() {
    let (addr, _) = start_server(MockProvider::new(Behavior::Reply("a cat"))).await;
    let mut socket = connect_ready(addr).await;

    send_text(
        &mut socket,
        r#"{"type":"PROCESS_MULTIMODAL","text":"what is this","imageData":"/9j/"}"#,
    )
    .await;
    let reply = recv_json(&mut socket).await;
    assert_eq!(reply, json!({"type": "GEMINI_RESPONSE", "response": "a cat"}));
    assert_silent(&mut socket, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn provider_failure_yields_one_specific_error() {
    let (addr, _) = start_server(MockProvider::new(Behavior::Fail)).await;
    let mut socket = connect_ready(addr).await;

    send_text(&mut socket, r#"{"type":"PROCESS_TEXT","text":"hi"}"#).await;
    let reply = recv_json(&mut socket).await;
    assert_eq!(
        reply,
        json!({"type": "ERROR", "error": "Failed to process text with Gemini"})
    );
    assert_silent(&mut socket, Duration::from_millis(200)).await;

    send_text(
        &mut socket,
        r#"{"type":"PROCESS_MULTIMODAL","text":"x","imageData":"/9j/"}"#,
    )
    .await;
    let reply = recv_json(&mut socket).await;
    assert_eq!(
        reply,
        json!({"type": "ERROR", "error": "Failed to process multimodal data with Gemini"})
    );
}

#[tokio::test]
async fn malformed_frames_get_error_and_connection_stays_open() {
    let (addr, registry) = start_server(MockProvider::new(Behavior::Reply("ok"))).await;
    let mut socket = connect_ready(addr).await;

    for raw in ["{not json", "[]", r#"{"text":"no type"}"#, r#"{"type":"PROCESS_TEXT"}"#] {
        send_text(&mut socket, raw).await;
        let reply = recv_json(&mut socket).await;
        assert_eq!(reply, json!({"type": "ERROR", "error": "Failed to process message"}));
    }

    // Still usable afterwards.
    send_text(&mut socket, r#"{"type":"PROCESS_TEXT","text":"hi"}"#).await;
    let reply = recv_json(&mut socket).await;
    assert_eq!(reply["type"], "GEMINI_RESPONSE");
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn recording_acknowledgements_are_idempotent() {
    let (addr, _) = start_server(MockProvider::new(Behavior::Reply("unused"))).await;
    let mut socket = connect_ready(addr).await;

    send_text(&mut socket, r#"{"type":"START_RECORDING"}"#).await;
    send_text(&mut socket, r#"{"type":"START_RECORDING"}"#).await;
    assert_eq!(recv_json(&mut socket).await, json!({"type": "RECORDING_STARTED"}));
    assert_eq!(recv_json(&mut socket).await, json!({"type": "RECORDING_STARTED"}));

    send_text(&mut socket, r#"{"type":"STOP_RECORDING"}"#).await;
    assert_eq!(recv_json(&mut socket).await, json!({"type": "RECORDING_STOPPED"}));
}

#[tokio::test]
async fn unknown_and_audio_frames_are_ignored() {
    let (addr, _) = start_server(MockProvider::new(Behavior::Reply("unused"))).await;
    let mut socket = connect_ready(addr).await;

    send_text(&mut socket, r#"{"type":"UNKNOWN_TYPE"}"#).await;
    send_text(&mut socket, r#"{"type":"AUDIO_DATA","chunk":"AAAA"}"#).await;
    assert_silent(&mut socket, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn abrupt_disconnect_removes_exactly_one_connection() {
    let (addr, registry) = start_server(MockProvider::new(Behavior::Reply("unused"))).await;
    let _first = connect_ready(addr).await;
    let second = connect_ready(addr).await;
    wait_for_len(&registry, 2).await;

    drop(second);
    wait_for_len(&registry, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn disconnect_during_slow_requests_is_noticed_immediately() {
    let provider = MockProvider::new(Behavior::SlowEcho(Duration::from_secs(3)));
    let (addr, registry) = start_server(provider.clone()).await;
    let mut socket = connect_ready(addr).await;
    wait_for_len(&registry, 1).await;

    // One request in flight and two queued behind it.
    for text in ["one", "two", "three"] {
        let frame = json!({"type": "PROCESS_TEXT", "text": text});
        send_text(&mut socket, &frame.to_string()).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    let dropped_at = Instant::now();
    drop(socket);
    wait_for_len_within(&registry, 0, Duration::from_secs(1)).await;
    assert!(dropped_at.elapsed() < Duration::from_secs(1));

    // The queued requests are discarded with the connection.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn client_close_gets_close_reply() {
    let (addr, registry) = start_server(MockProvider::new(Behavior::Reply("unused"))).await;
    let mut socket = connect_ready(addr).await;

    socket.close(None).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for the close reply");
    assert!(
        matches!(reply, Some(Ok(Message::Close(_)))),
        "expected a close reply, got {:?}",
        reply
    );
    wait_for_len(&registry, 0).await;
}

#[tokio::test]
async fn client_subscriber_receives_greeting() {
    let (addr, _) = start_server(MockProvider::new(Behavior::Reply("unused"))).await;
    let connection = RelayConnection::connect(&format!("ws://{}", addr)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut events = connection.subscribe();
    let greeting = tokio::time::timeout(Duration::from_millis(500), events.recv())
        .await
        .expect("greeting was not delivered")
        .unwrap();
    assert_eq!(greeting, ServerMessage::connected());
}

#[tokio::test]
async fn requests_on_one_connection_are_processed_sequentially() {
    let provider = MockProvider::new(Behavior::SlowEcho(Duration::from_millis(100)));
    let (addr, _) = start_server(provider.clone()).await;
    let mut socket = connect_ready(addr).await;

    for text in ["one", "two", "three"] {
        let frame = json!({"type": "PROCESS_TEXT", "text": text});
        send_text(&mut socket, &frame.to_string()).await;
    }

    for expected in ["one", "two", "three"] {
        let reply = recv_json(&mut socket).await;
        assert_eq!(reply, json!({"type": "GEMINI_RESPONSE", "response": expected}));
    }
    assert_eq!(provider.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn correlation_id_is_echoed() {
    let (addr, _) = start_server(MockProvider::new(Behavior::Reply("hello"))).await;
    let mut socket = connect_ready(addr).await;

    send_text(&mut socket, r#"{"type":"PROCESS_TEXT","text":"hi","id":"req-42"}"#).await;
    let reply = recv_json(&mut socket).await;
    assert_eq!(
        reply,
        json!({"type": "GEMINI_RESPONSE", "response": "hello", "id": "req-42"})
    );
}

#[tokio::test]
async fn client_session_round_trip_through_relay() {
    let (addr, registry) = start_server(MockProvider::new(Behavior::Reply("hello"))).await;
    let connection = Arc::new(RelayConnection::connect(&format!("ws://{}", addr)).await.unwrap());
    wait_for_len(&registry, 1).await;

    let session = GeminiSession::new(connection.clone());
    assert_eq!(session.process_text("hi").await.unwrap(), "hello");
    assert_eq!(session.response().as_deref(), Some("hello"));

    drop(session);
    let connection = Arc::try_unwrap(connection).ok().unwrap();
    connection.close().await;
    wait_for_len(&registry, 0).await;
}

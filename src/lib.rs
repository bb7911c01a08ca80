//! geminirelay - real-time WebSocket relay in front of the Gemini API
//!
//! A small server accepts persistent WebSocket connections, forwards text and
//! text + image requests to Gemini and relays the answers back on the same
//! connection. The client side ([`client`], [`hooks`]) keeps one connection
//! to the relay and exposes the request flows a front end needs.

#![forbid(unsafe_code)]

/// Client connection manager
pub mod client;
/// Wire protocol shared by server and client
pub mod events;
/// Gemini REST API types
pub mod gemini;
/// Gemini provider client
pub mod gemini_client;
/// Processing and recording flows
pub mod hooks;
/// Live connection registry
pub mod registry;
/// Relay server
pub mod server;
/// Per-connection writer task
pub mod ws_writer;

pub use client::{ClientError, ConnectionStatus, RelayConnection};
pub use events::{ClientMessage, ServerMessage};
pub use gemini::{GeminiClientConfig, GeminiError};
pub use gemini_client::{GeminiClient, Provider};
pub use hooks::{GeminiSession, VoiceRecording};
pub use registry::ConnectionRegistry;
pub use server::{RelayConfig, RelayServer};

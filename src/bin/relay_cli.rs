//! Terminal front end for the relay.
//!
//! Plain lines are sent as text requests. Commands:
//! `/image <path> <prompt>`, `/start`, `/stop`, `/status`, `/quit`.

use anyhow::{Context, Result};
use clap::Parser;
use geminirelay::hooks::HookError;
use geminirelay::{GeminiSession, RelayConnection, ServerMessage, VoiceRecording};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay_cli", about = "Talk to a geminirelay server from the terminal")]
struct Cli {
    /// Relay server URL
    #[arg(long, env = "RELAY_URL", default_value = "ws://localhost:8080")]
    url: String,
}

const IMAGE_USAGE: &str = "usage: /image <path> <prompt>";

enum Command<'a> {
    Text(&'a str),
    Image { path: &'a str, prompt: &'a str },
    StartRecording,
    StopRecording,
    Status,
    Quit,
    /// Recognised command with missing arguments; holds the usage line.
    Usage(&'static str),
}

fn parse_command(line: &str) -> Option<Command<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let command = match line.split_once(char::is_whitespace) {
        Some(("/image", rest)) => {
            let rest = rest.trim_start();
            let (path, prompt) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            Command::Image {
                path,
                prompt: prompt.trim(),
            }
        }
        _ => match line {
            "/image" => Command::Usage(IMAGE_USAGE),
            "/start" => Command::StartRecording,
            "/stop" => Command::StopRecording,
            "/status" => Command::Status,
            "/quit" | "/exit" => Command::Quit,
            text => Command::Text(text),
        },
    };
    Some(command)
}

fn print_result(result: Result<String, HookError>) {
    match result {
        Ok(response) => println!("{}\n", response),
        Err(e) => eprintln!("error: {}\n", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let connection = Arc::new(
        RelayConnection::connect(&cli.url)
            .await
            .with_context(|| format!("could not reach {}", cli.url))?,
    );

    let mut events = connection.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServerMessage::Connected { message }) => println!("* {}", message),
                Ok(ServerMessage::RecordingStarted) => println!("* recording started"),
                Ok(ServerMessage::RecordingStopped) => println!("* recording stopped"),
                Ok(other) => debug!("Unsolicited {} frame", other.kind()),
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} server frames", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let session = GeminiSession::new(connection.clone());
    let recording = VoiceRecording::new(connection.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line) else {
            continue;
        };

        match command {
            Command::Text(text) => print_result(session.process_text(text).await),
            Command::Image { path, prompt } => match tokio::fs::read(path).await {
                Ok(image) => print_result(session.process_multimodal(prompt, &image).await),
                Err(e) => eprintln!("error: cannot read {}: {}\n", path, e),
            },
            Command::StartRecording => {
                if let Err(e) = recording.start_recording() {
                    eprintln!("error: {}", e);
                }
            }
            Command::StopRecording => {
                if let Err(e) = recording.stop_recording() {
                    eprintln!("error: {}", e);
                }
            }
            Command::Status => {
                let status = connection.status();
                println!(
                    "connected: {} | recording: {} | processing: {} | error: {}",
                    status.connected,
                    recording.is_recording(),
                    session.is_processing(),
                    status.error.as_deref().unwrap_or("-")
                );
            }
            Command::Quit => break,
            Command::Usage(usage) => eprintln!("{}\n", usage),
        }
    }

    drop(session);
    drop(recording);
    if let Ok(connection) = Arc::try_unwrap(connection) {
        connection.close().await;
    }
    Ok(())
}

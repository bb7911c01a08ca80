//! geminirelay - WebSocket relay server for the Gemini API

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use geminirelay::gemini::{DEFAULT_BASE_URL, DEFAULT_TEXT_MODEL, DEFAULT_VISION_MODEL};
use geminirelay::server::DEFAULT_PORT;
use geminirelay::{GeminiClient, GeminiClientConfig, RelayConfig, RelayServer};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "geminirelay", version, about = "WebSocket relay for the Gemini API")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "RELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Model used for text requests
    #[arg(long, env = "GEMINI_TEXT_MODEL", default_value = DEFAULT_TEXT_MODEL)]
    text_model: String,

    /// Model used for text + image requests
    #[arg(long, env = "GEMINI_VISION_MODEL", default_value = DEFAULT_VISION_MODEL)]
    vision_model: String,

    /// Gemini REST API base URL
    #[arg(long, env = "GEMINI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Values from a local .env file act as environment defaults.
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    info!("Starting WebSocket Server...");

    let gemini_config = GeminiClientConfig {
        base_url: cli.base_url,
        text_model: cli.text_model,
        vision_model: cli.vision_model,
        ..Default::default()
    };
    let provider = Arc::new(GeminiClient::from_api_key(&cli.api_key, Some(gemini_config)));

    let relay_config = RelayConfig {
        bind_addr: SocketAddr::new(cli.host, cli.port),
    };
    let server = RelayServer::bind(&relay_config, provider)
        .await
        .with_context(|| format!("failed to bind {}", relay_config.bind_addr))?;

    server
        .serve_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("WebSocket Server stopped");
    Ok(())
}

//! Lifeline API server binary.
//!
//! Usage:
//!   lifeline-api --config lifeline.toml
//!   lifeline-api --port 8080 --bind 0.0.0.0
//!
//! # Environment Variables
//!
//! - `LIFELINE_API_KEY` - Bearer key for signal and admin routes (recommended)
//! - `LIFELINE_BIND_ADDR` - Server bind address (default: 127.0.0.1)
//! - `LIFELINE_CORS_ORIGINS` - CORS allowed origins (comma-separated)
//! - `LIFELINE_SESSION_WEBHOOK` - URL notified when a session is granted

use lifeline_api::{serve, ApiKeyConfig, AppState, ServerConfig, WebhookConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn print_help() {
    println!("Lifeline API Server");
    println!();
    println!("Usage: lifeline-api [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -p, --port <PORT>        Port to listen on (default: 8080)");
    println!("  -b, --bind <ADDR>        Bind address (default: 127.0.0.1, env: LIFELINE_BIND_ADDR)");
    println!("  -c, --config <FILE>      Path to config TOML file");
    println!("  -h, --help               Show this help message");
    println!();
    println!("Environment variables:");
    println!("  LIFELINE_API_KEY          Bearer key for signal and admin routes");
    println!("  LIFELINE_BIND_ADDR        Server bind address (overridden by --bind)");
    println!("  LIFELINE_CORS_ORIGINS     CORS allowed origins (comma-separated)");
    println!("  LIFELINE_SESSION_WEBHOOK  URL notified when a session is granted");
}

fn flag_value(args: &[String], i: usize, flag: &str) -> anyhow::Result<String> {
    args.get(i + 1)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("{} requires a value", flag))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,lifeline_api=debug,lifeline_dispatch=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut port: u16 = 8080;
    let mut config_path: Option<String> = None;
    let mut bind_addr: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                port = flag_value(&args, i, "--port")?
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid port number: {}", e))?;
                i += 1;
            }
            "--config" | "-c" => {
                config_path = Some(flag_value(&args, i, "--config")?);
                i += 1;
            }
            "--bind" | "-b" => {
                bind_addr = Some(flag_value(&args, i, "--bind")?);
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                tracing::warn!(arg = %other, "Ignoring unknown argument");
            }
        }
        i += 1;
    }

    // CLI flag > env var > default
    let host = bind_addr
        .or_else(|| std::env::var("LIFELINE_BIND_ADDR").ok())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    if host == "0.0.0.0" {
        tracing::warn!(
            "Server binding to 0.0.0.0, exposing the API on all interfaces. \
             Ensure LIFELINE_API_KEY is set and a firewall is in place."
        );
    }

    let mut config = match config_path {
        Some(path) => {
            tracing::info!(path = %path, "Loading configuration");
            ServerConfig::from_file(&path)?
        }
        None => {
            tracing::info!("Using default configuration");
            ServerConfig::default()
        }
    };

    if let Ok(url) = std::env::var("LIFELINE_SESSION_WEBHOOK") {
        config.session_webhook = Some(WebhookConfig::new(url));
        config.validate()?;
    }

    let cors_origins: Option<Vec<String>> = std::env::var("LIFELINE_CORS_ORIGINS")
        .ok()
        .map(|s| s.split(',').map(|o| o.trim().to_string()).collect());

    let mut state = AppState::new(config)?;

    if let Ok(key) = std::env::var("LIFELINE_API_KEY") {
        state = state.with_api_key(ApiKeyConfig::new(key));
        tracing::info!("API key authentication enabled");
    } else if state.api_key.is_none() {
        tracing::warn!(
            "LIFELINE_API_KEY not set. Signal and admin routes will accept \
             unauthenticated requests; do not run like this in production."
        );
    }

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    serve(Arc::new(state), addr, cors_origins).await?;

    Ok(())
}

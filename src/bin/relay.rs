//! Cipherchat Relay Server
//!
//! Accepts client connections, decrypts every text message with the key it
//! carries, searches it for the configured phrase, answers the sender with
//! the match positions and relays the ciphertext to everyone else.
//!
//! Usage:
//!   cipherchat-relay [--config relay.json] [--host 0.0.0.0] [--port 8888]
//!                    [--phrase "xin chào"] [--files-dir DIR] [--no-relay] [-v]

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use cipherchat::{Server, ServerConfig, ServerEvent};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Cipherchat Relay Server
#[derive(Parser)]
#[command(name = "cipherchat-relay")]
#[command(about = "Relay server for cipherchat clients")]
struct Args {
    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Phrase to search for in decrypted messages
    #[arg(long)]
    phrase: Option<String>,

    /// Directory for received files
    #[arg(long)]
    files_dir: Option<PathBuf>,

    /// Do not forward text messages to other clients
    #[arg(long)]
    no_relay: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, String> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path).map_err(|e| e.to_string())?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.bind = SocketAddr::new(host, config.bind.port());
        }
        if let Some(port) = self.port {
            config.bind.set_port(port);
        }
        if let Some(phrase) = self.phrase {
            config.search_phrase = phrase;
        }
        if let Some(dir) = self.files_dir {
            config.files_dir = dir;
        }
        if self.no_relay {
            config.relay_text = false;
        }
        Ok(config)
    }
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::Error { .. } => warn!(target: "cipherchat_relay::events", "{event}"),
        _ => info!(target: "cipherchat_relay::events", "{event}"),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("cipherchat={default_level},cipherchat_relay={default_level}"))),
        )
        .init();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };
    info!(files_dir = %config.files_dir.display(), relay = config.relay_text, "Starting relay");

    let server = Server::new(config);
    server.events().subscribe(Arc::new(log_event));

    let running = match server.bind().await {
        Ok(running) => running,
        Err(e) => {
            error!(error = %e, "Failed to start");
            std::process::exit(1);
        }
    };

    running
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Could not listen for Ctrl-C");
            }
        })
        .await;
}

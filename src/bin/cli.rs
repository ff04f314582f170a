//! Cipherchat CLI tool
//!
//! Interactive chat client for a cipherchat relay, plus offline helpers to
//! encrypt, decrypt and inspect cipher matrices.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use cipherchat::crypto::{decrypt, encrypt, CipherMatrix};
use cipherchat::protocol::{FilePayload, KeyExchangePayload, PhrasePositionsPayload, TextPayload};
use cipherchat::session::{DisconnectReason, DEFAULT_KEY};
use cipherchat::{Identity, Session, SessionHandler, SessionState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Cipherchat: chat over a relay with a classical digraph cipher
#[derive(Parser)]
#[command(name = "cipherchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session with a relay
    Chat {
        /// Relay address (host:port)
        addr: String,

        /// Cipher key to announce after connecting
        #[arg(short, long)]
        key: Option<String>,

        /// Numeric user id to announce
        #[arg(long, requires = "username")]
        user_id: Option<u64>,

        /// Display name to announce
        #[arg(long, requires = "user_id")]
        username: Option<String>,
    },

    /// Encrypt text
    Encrypt {
        /// Plaintext
        text: String,

        /// Cipher key
        #[arg(short, long, default_value = DEFAULT_KEY)]
        key: String,
    },

    /// Decrypt ciphertext
    Decrypt {
        /// Ciphertext
        ciphertext: String,

        /// Cipher key
        #[arg(short, long, default_value = DEFAULT_KEY)]
        key: String,
    },

    /// Print the 5x5 matrix for a key
    Matrix {
        /// Cipher key
        #[arg(short, long, default_value = DEFAULT_KEY)]
        key: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("cipherchat={level}"))),
        )
        .init();

    match cli.command {
        Commands::Chat {
            addr,
            key,
            user_id,
            username,
        } => {
            let identity = user_id.zip(username).map(|(id, name)| Identity::new(id, name));
            cmd_chat(&addr, key.as_deref(), identity).await
        }
        Commands::Encrypt { text, key } => cmd_encrypt(&text, &key),
        Commands::Decrypt { ciphertext, key } => cmd_decrypt(&ciphertext, &key),
        Commands::Matrix { key } => cmd_matrix(&key),
    }
}

/// Prints whatever the relay sends
struct Printer;

impl SessionHandler for Printer {
    fn on_text(&self, text: TextPayload) {
        let from = text
            .sender
            .as_ref()
            .map(Identity::to_string)
            .unwrap_or_else(|| "anonymous".to_string());
        println!("<{from}> {} (key {})", text.ciphertext, text.key);
        println!("    decrypted: {}", text.decrypt());
    }

    fn on_phrase_positions(&self, result: PhrasePositionsPayload) {
        println!("    phrase \"{}\": {result}", result.phrase);
    }

    fn on_key_exchange(&self, exchange: KeyExchangePayload) {
        println!("Key confirmed by server: {}", exchange.key);
    }

    fn on_file(&self, file: FilePayload) {
        println!("Received {} file {} ({} bytes)", file.category, file.name, file.data.len());
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        if *reason != DisconnectReason::Local {
            eprintln!("Disconnected: {reason}");
        }
    }
}

async fn cmd_chat(addr: &str, key: Option<&str>, identity: Option<Identity>) {
    let session = Session::new(Arc::new(Printer));
    session.set_identity(identity);

    if let Err(e) = session.connect(addr).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    if let Some(key) = key {
        if let Err(e) = session.send_key_exchange(key).await {
            eprintln!("Error sending key: {e}");
        }
    }

    println!("=== Cipherchat Session ===");
    println!();
    println!("Connected to {addr}, key {}", session.current_key());
    println!();
    println!("Commands:");
    println!("  <text>          - Encrypt and send a message");
    println!("  /key <key>      - Switch to a new key and announce it");
    println!("  /file <path>    - Send a file");
    println!("  /quit           - Exit session");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = session.watch_state();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = state.wait_for(|s| *s == SessionState::Disconnected) => break,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            break;
        } else if let Some(key) = line.strip_prefix("/key ") {
            match session.send_key_exchange(key.trim()).await {
                Ok(()) => println!("Key set to {}", session.current_key()),
                Err(e) => eprintln!("Error: {e}"),
            }
        } else if let Some(path) = line.strip_prefix("/file ") {
            match session.send_file_path(path.trim()).await {
                Ok(file) => println!(
                    "Sent {} file {} ({} bytes)",
                    file.category, file.name, file.declared_len
                ),
                Err(e) => eprintln!("Error: {e}"),
            }
        } else if line.starts_with('/') {
            eprintln!("Unknown command: {line}");
        } else {
            match session.send_message(line).await {
                Ok(sent) => println!("<you> {} (key {})", sent.ciphertext, sent.key),
                Err(e) => eprintln!("Error: {e}"),
            }
        }
    }

    session.disconnect().await;
}

fn cmd_encrypt(text: &str, key: &str) {
    println!("{}", encrypt(text, key));
}

fn cmd_decrypt(ciphertext: &str, key: &str) {
    println!("{}", decrypt(ciphertext, key));
}

fn cmd_matrix(key: &str) {
    print!("{}", CipherMatrix::build(key));
}

//! Server and client configuration
//!
//! Server settings can come from a JSON file; every key is optional and
//! falls back to its default. Unknown keys are rejected so a typo does not
//! silently revert a setting.
//!
//! ```json
//! {
//!   "bind": "0.0.0.0:8888",
//!   "search_phrase": "xin chào",
//!   "relay_text": true,
//!   "files_dir": "/var/lib/cipherchat/files",
//!   "max_frame_len": 67108864
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_FRAME_LEN;

/// Default listening port
pub const DEFAULT_PORT: u16 = 8888;

/// Default phrase the server searches for
pub const DEFAULT_SEARCH_PHRASE: &str = "xin chào";

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file is not valid configuration
    #[error("Invalid config {path}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },
}

/// Relay server settings
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: SocketAddr,
    /// Phrase searched for in every decrypted message
    pub search_phrase: String,
    /// Forward text messages to every other connection
    pub relay_text: bool,
    /// Directory for received files
    pub files_dir: PathBuf,
    /// Largest accepted frame payload in bytes
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            search_phrase: DEFAULT_SEARCH_PHRASE.to_string(),
            relay_text: true,
            files_dir: std::env::temp_dir().join("chat_received_files"),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    /// Load settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse settings from JSON text
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Client session settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Limit on establishing the TCP connection
    pub connect_timeout: Duration,
    /// Limit on waiting for the receive loop during disconnect
    pub shutdown_timeout: Duration,
    /// Limit on writing one frame; a stalled peer ends the connection
    pub write_timeout: Duration,
    /// Largest accepted frame payload in bytes
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

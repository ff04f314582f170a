//! # Cipherchat
//!
//! Chat relay with a classical digraph cipher over a framed TCP protocol.
//!
//! ## Features
//!
//! - **Playfair-style cipher** keyed per message, with diacritic folding
//! - **Binary framing** for text, files, key exchange, identities and
//!   phrase search results
//! - **Async relay server** with one task per connection and broadcast
//! - **Phrase search** over every decrypted message
//!
//! ## Quick Start
//!
//! ```rust
//! use cipherchat::crypto::{decrypt, encrypt};
//! use cipherchat::search::{find_positions, normalize_phrase};
//!
//! let ciphertext = encrypt("hello world", "TESTKEY");
//! let plaintext = decrypt(&ciphertext, "TESTKEY");
//! assert_eq!(plaintext, "HELXLOZWORLD");
//! assert_eq!(find_positions(&plaintext, &normalize_phrase("world")), vec![7]);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              APPLICATION LAYER              │
//! │       cipherchat CLI  |  cipherchat-relay   │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │             CONNECTION LAYER                │
//! │  Session (client) | Registry + Handler      │
//! │  EventNotifier    | Stores                  │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │              PROTOCOL LAYER                 │
//! │   Envelope | frame codec | async read/write │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │               CRYPTO LAYER                  │
//! │   normalize | 5x5 matrix | digraph cipher   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The cipher provides no confidentiality against a motivated attacker and
//! no integrity. Run the relay on trusted networks only.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod crypto;
pub mod events;
pub mod protocol;
pub mod search;
pub mod server;
pub mod session;
pub mod store;

// Re-export main types at crate root
pub use config::{ClientConfig, ServerConfig};
pub use events::{EventNotifier, ServerEvent, ServerObserver};
pub use protocol::{Envelope, Identity, ProtocolError, ProtocolResult};
pub use server::{RunningServer, Server, ServerError};
pub use session::{ConnectError, Session, SessionError, SessionHandler, SessionState};

//! Wire protocol
//!
//! Length-prefixed binary frames over any byte stream. Each frame carries
//! one [`Envelope`]; see [`codec`] for the exact layout.
//!
//! Every decode failure is terminal for the connection that produced it,
//! since the reader can no longer trust where the next frame starts.

use std::io;

use thiserror::Error;

pub mod codec;
mod envelope;

pub use codec::{
    read_envelope, write_envelope, write_frame, DEFAULT_MAX_FRAME_LEN, FRAME_HEADER_SIZE,
    PROTOCOL_VERSION,
};
pub use envelope::{
    Envelope, EnvelopeKind, FilePayload, Identity, KeyExchangePayload, MediaCategory,
    PhrasePositionsPayload, TextPayload,
};

/// Errors produced while encoding, decoding or moving frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The input ended before a complete frame was read
    #[error("Stream ended inside a frame")]
    EndOfStream,

    /// The kind byte names no known envelope
    #[error("Unknown envelope kind: {0}")]
    UnknownKind(u8),

    /// The version byte is not [`PROTOCOL_VERSION`]
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The payload length exceeds the configured limit
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Announced payload size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// A field inside an otherwise complete frame is invalid
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// A file's declared length disagrees with its contents
    #[error("File length mismatch: declared {declared}, got {actual}")]
    LengthMismatch {
        /// Length announced by the sender
        declared: u64,
        /// Bytes actually carried
        actual: u64,
    },

    /// A field is too long for its length prefix
    #[error("Field {field} too long to encode: {len} bytes")]
    FieldTooLong {
        /// Field name
        field: &'static str,
        /// Field length
        len: usize,
    },

    /// Underlying stream failure
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl ProtocolError {
    /// True when the stream was cut short rather than carrying bad data
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, ProtocolError::EndOfStream)
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::EndOfStream
        } else {
            ProtocolError::Io(err)
        }
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

//! Envelope and payload types
//!
//! One [`Envelope`] is one logical message on the wire. The kind alone
//! decides how the payload is parsed.

use std::fmt;
use std::path::Path;

use super::{ProtocolError, ProtocolResult};
use crate::crypto;

/// Wire discriminant of an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Encrypted chat text
    Text = 1,
    /// File attachment
    File = 2,
    /// Cipher key synchronization
    KeyExchange = 3,
    /// Phrase search result sent back to the author of a text
    PhrasePositions = 4,
    /// Authenticated user attached to a connection
    Identity = 5,
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EnvelopeKind::Text),
            2 => Ok(EnvelopeKind::File),
            3 => Ok(EnvelopeKind::KeyExchange),
            4 => Ok(EnvelopeKind::PhrasePositions),
            5 => Ok(EnvelopeKind::Identity),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// User reference established by out-of-band authentication
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Numeric user id
    pub id: u64,
    /// Display name
    pub username: String,
}

impl Identity {
    /// Create an identity
    pub fn new(id: u64, username: impl Into<String>) -> Self {
        Identity {
            id,
            username: username.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.username, self.id)
    }
}

/// Encrypted chat message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextPayload {
    /// Cipher output, uppercase letters only
    pub ciphertext: String,
    /// Key the text was encrypted with
    pub key: String,
    /// Author, when known
    pub sender: Option<Identity>,
    /// Decrypted form, attached by the server
    pub decrypted: Option<String>,
    /// Search matches in the decrypted form, attached by the server
    pub positions: Option<Vec<u32>>,
}

impl TextPayload {
    /// Wrap an already encrypted text
    pub fn new(ciphertext: impl Into<String>, key: impl Into<String>) -> Self {
        TextPayload {
            ciphertext: ciphertext.into(),
            key: key.into(),
            sender: None,
            decrypted: None,
            positions: None,
        }
    }

    /// Encrypt `plaintext` under `key` and wrap the result
    pub fn encrypt(plaintext: &str, key: &str) -> Self {
        TextPayload::new(crypto::encrypt(plaintext, key), key)
    }

    /// Set the author
    pub fn with_sender(mut self, sender: Identity) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Decrypt the ciphertext with the carried key
    pub fn decrypt(&self) -> String {
        crypto::decrypt(&self.ciphertext, &self.key)
    }
}

/// Coarse media type of an attachment, inferred from its extension
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaCategory {
    /// Anything not recognized below
    Other = 0,
    /// jpg, jpeg, png, gif, bmp
    Image = 1,
    /// mp3, wav, ogg, flac, aac
    Audio = 2,
    /// mp4, avi, mkv, mov, wmv
    Video = 3,
}

impl MediaCategory {
    /// Infer the category from a file name
    pub fn from_file_name(name: &str) -> Self {
        let extension = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" => MediaCategory::Image,
            "mp3" | "wav" | "ogg" | "flac" | "aac" => MediaCategory::Audio,
            "mp4" | "avi" | "mkv" | "mov" | "wmv" => MediaCategory::Video,
            _ => MediaCategory::Other,
        }
    }

    /// Lowercase name of the category
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::Other => "other",
            MediaCategory::Image => "image",
            MediaCategory::Audio => "audio",
            MediaCategory::Video => "video",
        }
    }
}

impl TryFrom<u8> for MediaCategory {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MediaCategory::Other),
            1 => Ok(MediaCategory::Image),
            2 => Ok(MediaCategory::Audio),
            3 => Ok(MediaCategory::Video),
            other => Err(ProtocolError::Malformed(format!(
                "unknown media category {other}"
            ))),
        }
    }
}

impl fmt::Display for MediaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File attachment, sent unencrypted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilePayload {
    /// Original file name
    pub name: String,
    /// Length announced by the sender
    pub declared_len: u64,
    /// Media category
    pub category: MediaCategory,
    /// File contents
    pub data: Vec<u8>,
    /// Author, when known
    pub sender: Option<Identity>,
}

impl FilePayload {
    /// Build a payload whose declared length and category match `data`
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        let name = name.into();
        FilePayload {
            category: MediaCategory::from_file_name(&name),
            declared_len: data.len() as u64,
            name,
            data,
            sender: None,
        }
    }

    /// Read a file from disk into a payload
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        Ok(FilePayload::new(name, data))
    }

    /// Set the author
    pub fn with_sender(mut self, sender: Identity) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Check the declared length against the actual contents
    pub fn validate(&self) -> ProtocolResult<()> {
        let actual = self.data.len() as u64;
        if self.declared_len != actual {
            return Err(ProtocolError::LengthMismatch {
                declared: self.declared_len,
                actual,
            });
        }
        Ok(())
    }
}

/// Key sent by a client, echoed back by the server as confirmation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyExchangePayload {
    /// Cipher key
    pub key: String,
}

/// Phrase search result for one text message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhrasePositionsPayload {
    /// Phrase the server searched for, as configured
    pub phrase: String,
    /// Start index of every match in the decrypted text
    pub positions: Vec<u32>,
}

impl fmt::Display for PhrasePositionsPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.positions.is_empty() {
            return f.write_str("Not found");
        }
        let items: Vec<String> = self.positions.iter().map(u32::to_string).collect();
        write!(f, "[{}]", items.join(", "))
    }
}

/// One protocol message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    /// Encrypted chat text
    Text(TextPayload),
    /// File attachment
    File(FilePayload),
    /// Key synchronization
    KeyExchange(KeyExchangePayload),
    /// Phrase search result
    PhrasePositions(PhrasePositionsPayload),
    /// Connection identity
    Identity(Identity),
}

impl Envelope {
    /// Discriminant written on the wire
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Text(_) => EnvelopeKind::Text,
            Envelope::File(_) => EnvelopeKind::File,
            Envelope::KeyExchange(_) => EnvelopeKind::KeyExchange,
            Envelope::PhrasePositions(_) => EnvelopeKind::PhrasePositions,
            Envelope::Identity(_) => EnvelopeKind::Identity,
        }
    }

    /// Key exchange envelope for `key`
    pub fn key_exchange(key: impl Into<String>) -> Self {
        Envelope::KeyExchange(KeyExchangePayload { key: key.into() })
    }
}

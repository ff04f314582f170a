//! Persistence collaborators
//!
//! The server hands every decrypted message and every received file to a
//! store. Stores are traits so deployments can plug in their own backend;
//! this module ships in-memory implementations and a directory-backed file
//! store.
//!
//! Persistence is best-effort: a failing store is logged by the caller and
//! never tears down the connection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::protocol::{Identity, MediaCategory};

/// Errors from a store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem failure
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend refused the record
    #[error("Storage rejected record: {0}")]
    Rejected(String),

    /// The backend is not reachable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Identifier assigned to a stored record
pub type RecordId = u64;

/// Decrypted chat message as persisted by the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    /// Connection the message arrived on
    pub connection_tag: String,
    /// Author, when the connection was identified
    pub sender: Option<Identity>,
    /// Ciphertext as received
    pub ciphertext: String,
    /// Key it was encrypted with
    pub key: String,
    /// Decrypted text
    pub decrypted: String,
    /// Phrase matches in the decrypted text
    pub positions: Vec<u32>,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

/// A [`MessageRecord`] with its assigned id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    /// Assigned id, increasing in insertion order
    pub id: RecordId,
    /// The record
    pub record: MessageRecord,
}

/// Metadata of a persisted file attachment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    /// Connection the file arrived on
    pub connection_tag: String,
    /// Author, when the connection was identified
    pub sender: Option<Identity>,
    /// File name as sent
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Media category
    pub category: MediaCategory,
    /// Where the file store put the contents
    pub location: String,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

/// Sink for decrypted messages and file metadata
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a decrypted message
    async fn save_message(&self, record: MessageRecord) -> StoreResult<RecordId>;

    /// Persist file metadata
    async fn save_file(&self, record: FileRecord) -> StoreResult<RecordId>;

    /// Most recent `limit` messages in chronological order
    ///
    /// With `sender` set, only that user's messages are considered.
    async fn history(&self, sender: Option<u64>, limit: usize) -> StoreResult<Vec<StoredMessage>>;
}

/// Sink for file contents
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store `data` under a name derived from `name`, returning its location
    async fn store(&self, name: &str, data: &[u8]) -> StoreResult<String>;
}

/// Current wall clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Message store kept in process memory
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<StoredMessage>>,
    files: RwLock<Vec<(RecordId, FileRecord)>>,
    next_id: AtomicU64,
}

impl MemoryMessageStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages
    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Snapshot of stored file metadata
    pub async fn files(&self) -> Vec<FileRecord> {
        self.files
            .read()
            .await
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }

    fn allocate_id(&self) -> RecordId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save_message(&self, record: MessageRecord) -> StoreResult<RecordId> {
        let id = self.allocate_id();
        self.messages.write().await.push(StoredMessage { id, record });
        Ok(id)
    }

    async fn save_file(&self, record: FileRecord) -> StoreResult<RecordId> {
        let id = self.allocate_id();
        self.files.write().await.push((id, record));
        Ok(id)
    }

    async fn history(&self, sender: Option<u64>, limit: usize) -> StoreResult<Vec<StoredMessage>> {
        let messages = self.messages.read().await;
        let mut recent: Vec<StoredMessage> = messages
            .iter()
            .rev()
            .filter(|stored| match sender {
                Some(id) => stored.record.sender.as_ref().map(|s| s.id) == Some(id),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }
}

/// File store kept in process memory, keyed by location
#[derive(Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
    next_id: AtomicU64,
}

impl MemoryFileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents stored at `location`
    pub async fn get(&self, location: &str) -> Option<Vec<u8>> {
        self.files.read().await.get(location).cloned()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn store(&self, name: &str, data: &[u8]) -> StoreResult<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let location = format!("memory://{id}/{}", sanitize_file_name(name));
        self.files.write().await.insert(location.clone(), data.to_vec());
        Ok(location)
    }
}

/// File store writing each attachment into one directory
///
/// Files are saved as `<random hex>_<sanitized name>` so repeated names never
/// overwrite each other.
#[derive(Clone, Debug)]
pub struct DiskFileStore {
    root: PathBuf,
}

impl DiskFileStore {
    /// Store files under `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DiskFileStore { root: root.into() }
    }

    /// Target directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn store(&self, name: &str, data: &[u8]) -> StoreResult<String> {
        tokio::fs::create_dir_all(&self.root).await?;

        let prefix = hex::encode(rand::random::<[u8; 8]>());
        let path = self
            .root
            .join(format!("{prefix}_{}", sanitize_file_name(name)));
        tokio::fs::write(&path, data).await?;

        debug!(path = %path.display(), size = data.len(), "Stored file");
        Ok(path.display().to_string())
    }
}

/// Strip directory components and control characters from a sender-chosen name
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "attachment".to_string()
    } else {
        trimmed.to_string()
    }
}

//! Live connection set
//!
//! Every accepted socket gets a [`ConnectionHandle`] registered here. The
//! handle owns the write half of the socket behind a lock so replies from
//! the connection's own handler and broadcasts from other handlers never
//! interleave on the wire.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, warn};

use crate::protocol::{write_frame, Envelope, Identity, ProtocolError, ProtocolResult};

/// Stable id of one connection
pub type ConnectionId = u64;

/// Owned write half of a connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default limit on a single frame write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// One live connection
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    identity: StdRwLock<Option<Identity>>,
    writer: Mutex<Option<BoxedWriter>>,
    closing: watch::Sender<bool>,
    finalized: AtomicBool,
    write_timeout: Duration,
}

impl ConnectionHandle {
    fn new(id: ConnectionId, peer: SocketAddr, writer: BoxedWriter, write_timeout: Duration) -> Self {
        let (closing, _) = watch::channel(false);
        ConnectionHandle {
            id,
            peer,
            identity: StdRwLock::new(None),
            writer: Mutex::new(Some(writer)),
            closing,
            finalized: AtomicBool::new(false),
            write_timeout,
        }
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Sender tag recorded with persisted messages
    pub fn tag(&self) -> String {
        self.peer.to_string()
    }

    /// Identity attached to this connection, if any
    pub fn identity(&self) -> Option<Identity> {
        self.identity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Attach `identity` unless one is already attached
    ///
    /// Returns false, leaving the first identity in place, on a second call.
    pub fn attach_identity(&self, identity: Identity) -> bool {
        let mut slot = self
            .identity
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(identity);
        true
    }

    /// Encode and write one envelope
    pub async fn send(&self, envelope: &Envelope) -> ProtocolResult<()> {
        let frame = envelope.encode()?;
        self.send_frame(&frame).await
    }

    /// Write an encoded frame under the connection's send lock
    ///
    /// A failed write may leave part of a frame on the wire, so the write
    /// half is dropped and the connection asked to close; every later send
    /// fails at once.
    pub async fn send_frame(&self, frame: &[u8]) -> ProtocolResult<()> {
        let mut slot = self.writer.lock().await;
        let writer = slot.as_mut().ok_or_else(|| {
            ProtocolError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ))
        })?;

        let result = match tokio::time::timeout(self.write_timeout, write_frame(writer, frame)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "write timed out",
            ))),
        };

        if result.is_err() {
            slot.take();
            self.request_close();
        }
        result
    }

    /// Ask the connection's handler to stop; it finalizes on its own task
    pub fn request_close(&self) {
        self.closing.send_replace(true);
    }

    /// True once [`ConnectionHandle::request_close`] was called
    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Receiver that changes when a close is requested
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Shut down and drop the write half; later sends fail
    pub async fn close_transport(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(conn = self.id, error = %e, "Shutdown of write half failed");
            }
        }
    }

    /// Returns true for the first caller only
    pub(crate) fn mark_finalized(&self) -> bool {
        !self.finalized.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("identity", &self.identity())
            .finish()
    }
}

/// Concurrent map of live connections
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }

    /// Create an empty registry whose handles use `write_timeout`
    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        ConnectionRegistry {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            write_timeout,
        }
    }

    /// Register a new connection and return its handle
    pub async fn register(&self, peer: SocketAddr, writer: BoxedWriter) -> Arc<ConnectionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(ConnectionHandle::new(id, peer, writer, self.write_timeout));
        self.connections.write().await.insert(id, Arc::clone(&handle));
        debug!(conn = id, peer = %peer, "Registered connection");
        handle
    }

    /// Remove a connection
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.write().await.remove(&id)
    }

    /// Look up a connection
    pub async fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Number of live connections
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// True when no connection is registered
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Ids of live connections, ascending
    pub async fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Identity attached to a connection
    pub async fn identity_of(&self, id: ConnectionId) -> Option<Identity> {
        self.get(id).await.and_then(|handle| handle.identity())
    }

    /// Handles of every live connection
    pub async fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Write `envelope` to every connection except `exclude`
    ///
    /// Returns how many peers received it. A peer whose write fails is asked
    /// to close and finalizes on its own task; delivery to the rest goes on.
    pub async fn broadcast(&self, envelope: &Envelope, exclude: Option<ConnectionId>) -> usize {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Broadcast envelope could not be encoded");
                return 0;
            }
        };

        // Writes happen outside the map lock
        let targets: Vec<Arc<ConnectionHandle>> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|handle| Some(handle.id) != exclude && !handle.is_closing())
            .collect();

        let mut delivered = 0;
        for handle in targets {
            match handle.send_frame(&frame).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(conn = handle.id, peer = %handle.peer, error = %e, "Broadcast write failed");
                    handle.request_close();
                }
            }
        }
        delivered
    }

    /// Ask every connection to close; returns how many were asked
    pub async fn close_all(&self) -> usize {
        let handles = self.snapshot().await;
        for handle in &handles {
            handle.request_close();
        }
        handles.len()
    }
}

//! Client connection session
//!
//! A [`Session`] owns at most one connection to a relay server. It moves
//! through `Disconnected -> Connecting -> Connected -> Closing ->
//! Disconnected`; a failed connect goes straight back to `Disconnected`.
//!
//! While connected, a dedicated task reads frames and hands each one to the
//! [`SessionHandler`]. Sends can come from any task and are serialized on a
//! per-connection lock. Every write is bounded by the configured write
//! timeout, and `disconnect` never waits on a send in progress.

mod handler;

pub use handler::{DisconnectReason, SessionHandler};

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::protocol::{
    read_envelope, write_frame, Envelope, FilePayload, Identity, ProtocolError, TextPayload,
};

/// Key used until a key exchange sets another one
pub const DEFAULT_KEY: &str = "PLAYFAIR";

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No connection
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Receive loop running, sends allowed
    Connected,
    /// Disconnect in progress
    Closing,
}

/// Reasons a connect attempt failed, worded for display to a user
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The address could not be parsed
    #[error("Invalid server address {0}: expected host:port")]
    InvalidAddress(String),

    /// The host could not be resolved or reached
    #[error("Server {addr} is unreachable: {reason}")]
    Unreachable {
        /// Address as given
        addr: String,
        /// Underlying cause
        reason: String,
    },

    /// Nothing is listening at the address
    #[error("Connection to {0} refused; is the server running?")]
    Refused(String),

    /// No answer within the connect timeout
    #[error("Connection to {0} timed out")]
    Timeout(String),
}

impl ConnectError {
    fn classify(addr: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::Refused(addr.to_string()),
            io::ErrorKind::TimedOut => ConnectError::Timeout(addr.to_string()),
            io::ErrorKind::InvalidInput => ConnectError::InvalidAddress(addr.to_string()),
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                ConnectError::Unreachable {
                    addr: addr.to_string(),
                    reason: err.to_string(),
                }
            }
            _ => ConnectError::Unreachable {
                addr: addr.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// The operation needs a connected session
    #[error("Not connected")]
    NotConnected,

    /// Connect was called while not disconnected
    #[error("Session is already {0:?}")]
    Busy(SessionState),

    /// Establishing the connection failed
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Encoding or writing a frame failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer did not take a frame within the write timeout
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Local I/O failure, such as reading a file to send
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Write half of the current connection, guarded by the send lock
struct Link {
    id: u64,
    writer: BoxedWriter,
    closed: watch::Receiver<bool>,
}

/// Teardown side of the current connection, never held across a write
struct Control {
    id: u64,
    shutdown: watch::Sender<bool>,
    receiver: JoinHandle<()>,
}

struct Inner {
    config: ClientConfig,
    handler: Arc<dyn SessionHandler>,
    state: watch::Sender<SessionState>,
    link: Mutex<Option<Link>>,
    control: StdMutex<Option<Control>>,
    identity: RwLock<Option<Identity>>,
    current_key: RwLock<String>,
    next_link: AtomicU64,
}

/// Client side of one relay connection
///
/// Cheap to clone; clones drive the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create a disconnected session with default settings
    pub fn new(handler: Arc<dyn SessionHandler>) -> Self {
        Self::with_config(ClientConfig::default(), handler)
    }

    /// Create a disconnected session
    pub fn with_config(config: ClientConfig, handler: Arc<dyn SessionHandler>) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Session {
            inner: Arc::new(Inner {
                config,
                handler,
                state,
                link: Mutex::new(None),
                control: StdMutex::new(None),
                identity: RwLock::new(None),
                current_key: RwLock::new(DEFAULT_KEY.to_string()),
                next_link: AtomicU64::new(0),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// True while sends are accepted
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Set the identity announced on every future connect
    pub fn set_identity(&self, identity: Option<Identity>) {
        *self
            .inner
            .identity
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = identity;
    }

    /// Identity announced on connect, if any
    pub fn identity(&self) -> Option<Identity> {
        self.inner
            .identity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Key used by [`Session::send_message`]
    pub fn current_key(&self) -> String {
        self.inner
            .current_key
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Connect to `addr` (`host:port`)
    ///
    /// Fails with a [`ConnectError`] naming the cause and leaves the session
    /// disconnected. On success the receive loop is running and the identity,
    /// if set, has already been sent.
    pub async fn connect(&self, addr: &str) -> SessionResult<()> {
        self.begin_connect()?;

        let stream = match self.open(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.state.send_replace(SessionState::Disconnected);
                warn!(addr, error = %e, "Connect failed");
                return Err(e.into());
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle");
        }

        info!(addr, "Connected");
        self.install(stream).await
    }

    /// Run the session over an already established byte stream
    pub async fn attach<S>(&self, stream: S) -> SessionResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.begin_connect()?;
        self.install(stream).await
    }

    /// Close the connection
    ///
    /// Idempotent and bounded in time. A send blocked on a stalled peer is
    /// cancelled with [`SessionError::NotConnected`]. The receive loop is
    /// aborted if it does not stop within the configured shutdown timeout.
    pub async fn disconnect(&self) {
        let Some(mut control) = self.inner.take_control(None) else {
            return;
        };
        self.inner.state.send_replace(SessionState::Closing);

        control.shutdown.send_replace(true);
        self.inner.close_writer(control.id).await;

        let timeout = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(timeout, &mut control.receiver).await.is_err() {
            warn!(link = control.id, "Receive loop did not stop in time, aborting");
            control.receiver.abort();
        }

        self.inner.state.send_replace(SessionState::Disconnected);
        info!(link = control.id, "Disconnected");
        self.inner.handler.on_disconnected(&DisconnectReason::Local);
    }

    /// Send one envelope
    ///
    /// A write that fails or times out ends the connection, since part of
    /// the frame may already be on the wire.
    pub async fn send(&self, envelope: &Envelope) -> SessionResult<()> {
        let frame = envelope.encode()?;

        let mut slot = self.inner.link.lock().await;
        let link = slot.as_mut().ok_or(SessionError::NotConnected)?;
        let link_id = link.id;
        let closed = link.closed.clone();
        if *closed.borrow() {
            return Err(SessionError::NotConnected);
        }

        let timeout = self.inner.config.write_timeout;
        let written = tokio::select! {
            written = write_within(&mut link.writer, &frame, timeout) => written,
            _ = closed_signal(closed) => return Err(SessionError::NotConnected),
        };
        drop(slot);

        match written {
            Ok(()) => {
                debug!(link = link_id, kind = ?envelope.kind(), size = frame.len(), "Sent frame");
                Ok(())
            }
            Err(e) => {
                warn!(link = link_id, error = %e, "Send failed, closing connection");
                self.inner
                    .finish(link_id, DisconnectReason::Error(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Send an encrypted text, stamping the session identity if it has none
    pub async fn send_text(&self, mut text: TextPayload) -> SessionResult<()> {
        if text.sender.is_none() {
            text.sender = self.identity();
        }
        self.send(&Envelope::Text(text)).await
    }

    /// Encrypt `plaintext` with the current key and send it
    ///
    /// Returns the payload as sent so callers can display the ciphertext.
    pub async fn send_message(&self, plaintext: &str) -> SessionResult<TextPayload> {
        let mut text = TextPayload::encrypt(plaintext, &self.current_key());
        text.sender = self.identity();
        self.send(&Envelope::Text(text.clone())).await?;
        Ok(text)
    }

    /// Send a file attachment
    pub async fn send_file(&self, mut file: FilePayload) -> SessionResult<()> {
        if file.sender.is_none() {
            file.sender = self.identity();
        }
        self.send(&Envelope::File(file)).await
    }

    /// Read a file from disk and send it
    pub async fn send_file_path(&self, path: impl AsRef<Path>) -> SessionResult<FilePayload> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let file = FilePayload::from_path(path).await?;
        self.send_file(file.clone()).await?;
        Ok(file)
    }

    /// Announce a new key; later [`Session::send_message`] calls use it
    pub async fn send_key_exchange(&self, key: &str) -> SessionResult<()> {
        self.send(&Envelope::key_exchange(key)).await?;
        *self
            .inner
            .current_key
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = key.to_string();
        Ok(())
    }

    fn begin_connect(&self) -> SessionResult<()> {
        let mut current = SessionState::Disconnected;
        let claimed = self.inner.state.send_if_modified(|state| {
            current = *state;
            if *state == SessionState::Disconnected {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if claimed {
            Ok(())
        } else {
            Err(SessionError::Busy(current))
        }
    }

    async fn open(&self, addr: &str) -> Result<TcpStream, ConnectError> {
        let targets: Vec<SocketAddr> = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| ConnectError::classify(addr, e))?
            .collect();
        if targets.is_empty() {
            return Err(ConnectError::InvalidAddress(addr.to_string()));
        }

        connect_within(
            addr,
            self.inner.config.connect_timeout,
            TcpStream::connect(targets.as_slice()),
        )
        .await
    }

    async fn install<S>(&self, stream: S) -> SessionResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(reader);
        let mut writer: BoxedWriter = Box::new(writer);

        if let Some(identity) = self.identity() {
            let announced = match Envelope::Identity(identity).encode() {
                Ok(frame) => write_within(&mut writer, &frame, self.inner.config.write_timeout).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = announced {
                self.inner.state.send_replace(SessionState::Disconnected);
                return Err(e);
            }
        }

        let id = self.inner.next_link.fetch_add(1, Ordering::Relaxed) + 1;
        let (shutdown, closed) = watch::channel(false);

        *self.inner.link.lock().await = Some(Link {
            id,
            writer,
            closed: closed.clone(),
        });

        // Hold the control slot while spawning so a loop that ends
        // immediately finds its own link when it finalizes
        let mut control = self
            .inner
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let receiver = tokio::spawn(receive_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.handler),
            id,
            reader,
            closed,
            self.inner.config.max_frame_len,
        ));
        *control = Some(Control {
            id,
            shutdown,
            receiver,
        });
        self.inner.state.send_replace(SessionState::Connected);

        Ok(())
    }
}

impl Inner {
    /// Take the control slot, only if it still belongs to `link_id` when given
    fn take_control(&self, link_id: Option<u64>) -> Option<Control> {
        let mut slot = self
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match link_id {
            Some(id) if slot.as_ref().map(|control| control.id) != Some(id) => None,
            _ => slot.take(),
        }
    }

    /// Drop and shut down the write half of `link_id`
    ///
    /// Callers fire the closed signal first, so the send lock is released
    /// promptly; the wait is still bounded by the shutdown timeout.
    async fn close_writer(&self, link_id: u64) {
        let timeout = self.config.shutdown_timeout;
        let link = match tokio::time::timeout(timeout, self.link.lock()).await {
            Ok(mut slot) => {
                if slot.as_ref().is_some_and(|link| link.id == link_id) {
                    slot.take()
                } else {
                    None
                }
            }
            Err(_) => {
                warn!(link = link_id, "Send lock still held, leaving the writer");
                None
            }
        };

        if let Some(mut link) = link {
            match tokio::time::timeout(timeout, link.writer.shutdown()).await {
                Ok(Err(e)) => debug!(link = link_id, error = %e, "Writer shutdown failed"),
                Err(_) => debug!(link = link_id, "Writer shutdown timed out"),
                Ok(Ok(())) => {}
            }
        }
    }

    /// Tear down a link that ended on its own or failed a write
    async fn finish(&self, link_id: u64, reason: DisconnectReason) {
        // A local disconnect already took the link and reports on its own
        let Some(control) = self.take_control(Some(link_id)) else {
            return;
        };
        control.shutdown.send_replace(true);
        self.close_writer(link_id).await;

        self.state.send_replace(SessionState::Disconnected);
        info!(link = link_id, reason = %reason, "Connection ended");
        self.handler.on_disconnected(&reason);
    }
}

/// Write one frame, giving up after `timeout`
async fn write_within(writer: &mut BoxedWriter, frame: &[u8], timeout: Duration) -> SessionResult<()> {
    match tokio::time::timeout(timeout, write_frame(writer, frame)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(SessionError::WriteTimeout(timeout)),
    }
}

/// Resolves once the link is marked closed or its control side is gone
async fn closed_signal(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|is_closed| *is_closed).await;
}

/// Await `connecting`, mapping failure and expiry of `timeout` to a cause
async fn connect_within<F>(addr: &str, timeout: Duration, connecting: F) -> Result<TcpStream, ConnectError>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ConnectError::classify(addr, e)),
        Err(_) => Err(ConnectError::Timeout(addr.to_string())),
    }
}

async fn receive_loop(
    inner: Weak<Inner>,
    handler: Arc<dyn SessionHandler>,
    link_id: u64,
    mut reader: BoxedReader,
    mut shutdown: watch::Receiver<bool>,
    max_frame_len: usize,
) {
    debug!(link = link_id, "Receive loop started");

    let reason = loop {
        let next = tokio::select! {
            _ = shutdown.changed() => {
                debug!(link = link_id, "Receive loop stopped");
                return;
            }
            next = read_envelope(&mut reader, max_frame_len) => next,
        };

        match next {
            Ok(Some(envelope)) => handler::dispatch(handler.as_ref(), envelope),
            Ok(None) => break DisconnectReason::RemoteClosed,
            Err(e) => {
                warn!(link = link_id, error = %e, "Receive failed");
                break DisconnectReason::Error(e.to_string());
            }
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.finish(link_id, reason).await;
    }
}

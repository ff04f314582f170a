//! Relay server
//!
//! [`Server`] is the composition root: it owns the registry, the event
//! notifier and the stores, accepts connections, and spawns one
//! [`ConnectionHandler`] task per connection.
//!
//! Shutdown order:
//! 1. stop accepting
//! 2. ask every registered connection to close
//! 3. await every connection task
//! 4. release the listening socket

mod handler;
pub mod registry;

pub use handler::ConnectionHandler;
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::events::{EventNotifier, ServerEvent};
use crate::search::normalize_phrase;
use crate::store::{DiskFileStore, FileStore, MemoryMessageStore, MessageStore};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Underlying error
        source: io::Error,
    },

    /// Other socket failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// State shared by every connection handler
pub struct ServerContext {
    /// Server settings
    pub config: ServerConfig,
    /// Live connections
    pub registry: Arc<ConnectionRegistry>,
    /// Event fan-out
    pub events: EventNotifier,
    /// Message and file metadata sink
    pub messages: Arc<dyn MessageStore>,
    /// File contents sink
    pub files: Arc<dyn FileStore>,
    /// Search phrase in cipher alphabet form
    pub(crate) phrase: String,
}

impl ServerContext {
    /// Assemble a context
    pub fn new(
        config: ServerConfig,
        registry: Arc<ConnectionRegistry>,
        events: EventNotifier,
        messages: Arc<dyn MessageStore>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        let phrase = normalize_phrase(&config.search_phrase);
        ServerContext {
            config,
            registry,
            events,
            messages,
            files,
            phrase,
        }
    }
}

/// Unstarted relay server
pub struct Server {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    events: EventNotifier,
    messages: Arc<dyn MessageStore>,
    files: Arc<dyn FileStore>,
}

impl Server {
    /// Server with an in-memory message store and files saved under
    /// `config.files_dir`
    pub fn new(config: ServerConfig) -> Self {
        let files = Arc::new(DiskFileStore::new(config.files_dir.clone()));
        Server {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            events: EventNotifier::new(),
            messages: Arc::new(MemoryMessageStore::new()),
            files,
        }
    }

    /// Replace the message store
    pub fn with_message_store(mut self, messages: Arc<dyn MessageStore>) -> Self {
        self.messages = messages;
        self
    }

    /// Replace the file store
    pub fn with_file_store(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = files;
        self
    }

    /// Event notifier; subscribe before [`Server::bind`] to see `ServerStarted`
    pub fn events(&self) -> &EventNotifier {
        &self.events
    }

    /// Connection registry
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind the listening socket and start accepting
    pub async fn bind(self) -> ServerResult<RunningServer> {
        let addr = self.config.bind;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let ctx = Arc::new(ServerContext::new(
            self.config,
            self.registry,
            self.events,
            self.messages,
            self.files,
        ));

        let (stop, stop_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&ctx), stop_rx));

        info!(addr = %local_addr, phrase = %ctx.config.search_phrase, "Relay listening");
        ctx.events.emit(ServerEvent::ServerStarted { addr: local_addr });

        Ok(RunningServer {
            local_addr,
            ctx,
            stop,
            accept_task,
        })
    }
}

/// Server that is accepting connections
pub struct RunningServer {
    local_addr: SocketAddr,
    ctx: Arc<ServerContext>,
    stop: watch::Sender<bool>,
    accept_task: JoinHandle<(TcpListener, JoinSet<()>)>,
}

impl RunningServer {
    /// Bound address, with the real port when bound to port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    /// Event notifier
    pub fn events(&self) -> &EventNotifier {
        &self.ctx.events
    }

    /// Shared handler context
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Run until `signal` completes, then shut down
    pub async fn run_until<F>(self, signal: F)
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.shutdown().await;
    }

    /// Stop accepting, close every connection, await the workers, then
    /// release the listener
    pub async fn shutdown(self) {
        info!("Shutting down");
        self.stop.send_replace(true);

        let accepted = self.accept_task.await;

        let closing = self.ctx.registry.close_all().await;
        debug!(connections = closing, "Close requested for live connections");

        match accepted {
            Ok((listener, mut workers)) => {
                while let Some(result) = workers.join_next().await {
                    if let Err(e) = result {
                        warn!(error = %e, "Connection task failed");
                    }
                }
                drop(listener);
            }
            Err(e) => {
                error!(error = %e, "Accept loop failed");
                self.ctx.events.emit(ServerEvent::Error {
                    message: format!("accept loop failed: {e}"),
                });
            }
        }

        info!("Server stopped");
        self.ctx.events.emit(ServerEvent::ServerStopped);
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    mut stop: watch::Receiver<bool>,
) -> (TcpListener, JoinSet<()>) {
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Could not disable Nagle");
                    }
                    let (reader, writer) = stream.into_split();
                    let handle = ctx.registry.register(peer, Box::new(writer)).await;

                    info!(conn = handle.id(), peer = %peer, "Client connected");
                    ctx.events.emit(ServerEvent::ClientConnected { id: handle.id(), peer });

                    workers.spawn(ConnectionHandler::new(Arc::clone(&ctx), handle).run(reader));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    ctx.events.emit(ServerEvent::Error {
                        message: format!("accept failed: {e}"),
                    });
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },

            Some(finished) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = finished {
                    warn!(error = %e, "Connection task failed");
                }
            }
        }
    }

    (listener, workers)
}

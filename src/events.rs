//! Server event notification
//!
//! Connection handlers report what happens on each connection to an
//! [`EventNotifier`]. Observers (a log printer, a dashboard, a test) register
//! with the notifier and receive every event in emission order.
//!
//! Delivery is synchronous and best-effort: a panicking observer is caught
//! and skipped so the remaining observers and the emitting handler carry on.

use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use crate::protocol::{Identity, MediaCategory};

/// Something that happened on the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    /// The listener is accepting connections
    ServerStarted {
        /// Bound address
        addr: SocketAddr,
    },
    /// All connections closed and the listener released
    ServerStopped,
    /// A connection was accepted and registered
    ClientConnected {
        /// Connection id
        id: u64,
        /// Remote address
        peer: SocketAddr,
    },
    /// A connection was closed and removed
    ClientDisconnected {
        /// Connection id
        id: u64,
        /// Remote address
        peer: SocketAddr,
    },
    /// A text message was decrypted
    MessageReceived {
        /// Connection id
        id: u64,
        /// Decrypted text
        message: String,
    },
    /// A file attachment arrived
    FileReceived {
        /// Connection id
        id: u64,
        /// File name as sent
        name: String,
        /// Size in bytes
        size: u64,
        /// Media category
        category: MediaCategory,
    },
    /// A client announced its cipher key
    KeyExchangeReceived {
        /// Connection id
        id: u64,
        /// Announced key
        key: String,
    },
    /// A connection was bound to an identity
    IdentityReceived {
        /// Connection id
        id: u64,
        /// Attached identity
        identity: Identity,
    },
    /// A non-fatal failure worth surfacing
    Error {
        /// Human-readable description
        message: String,
    },
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEvent::ServerStarted { addr } => write!(f, "server listening on {addr}"),
            ServerEvent::ServerStopped => write!(f, "server stopped"),
            ServerEvent::ClientConnected { id, peer } => write!(f, "client {id} connected from {peer}"),
            ServerEvent::ClientDisconnected { id, peer } => {
                write!(f, "client {id} ({peer}) disconnected")
            }
            ServerEvent::MessageReceived { id, message } => write!(f, "client {id}: {message}"),
            ServerEvent::FileReceived {
                id,
                name,
                size,
                category,
            } => write!(f, "client {id} sent {category} file {name} ({size} bytes)"),
            ServerEvent::KeyExchangeReceived { id, key } => write!(f, "client {id} set key {key}"),
            ServerEvent::IdentityReceived { id, identity } => {
                write!(f, "client {id} identified as {identity}")
            }
            ServerEvent::Error { message } => write!(f, "error: {message}"),
        }
    }
}

/// Receiver of server events
///
/// Called on the emitting task, so implementations should return quickly.
pub trait ServerObserver: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &ServerEvent);
}

impl<F> ServerObserver for F
where
    F: Fn(&ServerEvent) + Send + Sync,
{
    fn on_event(&self, event: &ServerEvent) {
        self(event)
    }
}

/// Handle returned by [`EventNotifier::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct ChannelObserver(mpsc::UnboundedSender<ServerEvent>);

impl ServerObserver for ChannelObserver {
    fn on_event(&self, event: &ServerEvent) {
        // A dropped receiver just stops getting events
        let _ = self.0.send(event.clone());
    }
}

type ObserverList = Vec<(SubscriptionId, Arc<dyn ServerObserver>)>;

/// Fan-out of [`ServerEvent`]s to registered observers
///
/// Cheap to clone; clones share the observer list.
#[derive(Clone, Default)]
pub struct EventNotifier {
    observers: Arc<RwLock<ObserverList>>,
    next_id: Arc<AtomicU64>,
}

impl EventNotifier {
    /// Create a notifier with no observers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn ServerObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        observers.push((id, observer));
        id
    }

    /// Register a channel that receives a clone of every event
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(Arc::new(ChannelObserver(tx)));
        (id, rx)
    }

    /// Remove an observer; returns false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = observers.len();
        observers.retain(|(sub, _)| *sub != id);
        observers.len() != before
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Deliver `event` to every observer registered at the time of the call
    pub fn emit(&self, event: ServerEvent) {
        // Snapshot so observers may subscribe or unsubscribe while handling
        let snapshot: Vec<Arc<dyn ServerObserver>> = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in snapshot {
            let delivered = catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
            if delivered.is_err() {
                warn!(event = %event, "Event observer panicked");
            }
        }
    }
}

impl fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("observers", &self.observer_count())
            .finish()
    }
}

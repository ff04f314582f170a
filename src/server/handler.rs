//! Per-connection receive loop
//!
//! A [`ConnectionHandler`] reads one envelope at a time and dispatches by
//! kind:
//! - Identity: attached to the connection once, later ones ignored
//! - Text: decrypted with its own key, searched for the configured phrase,
//!   answered with a PhrasePositions envelope, relayed, then persisted
//! - File: contents and metadata persisted, no reply
//! - KeyExchange: echoed back as confirmation
//!
//! The loop ends on stream close, on any protocol error, or when the handle
//! is asked to close. Finalization then runs exactly once.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use super::registry::ConnectionHandle;
use super::ServerContext;
use crate::events::ServerEvent;
use crate::protocol::{
    read_envelope, Envelope, FilePayload, Identity, PhrasePositionsPayload, ProtocolResult,
    TextPayload,
};
use crate::search::find_positions;
use crate::store::{now_millis, FileRecord, MessageRecord};

/// Receive loop of one server connection
pub struct ConnectionHandler {
    ctx: Arc<ServerContext>,
    handle: Arc<ConnectionHandle>,
}

impl ConnectionHandler {
    /// Bind a handler to a registered connection
    pub fn new(ctx: Arc<ServerContext>, handle: Arc<ConnectionHandle>) -> Self {
        ConnectionHandler { ctx, handle }
    }

    /// Read and dispatch frames until the connection ends, then finalize
    pub async fn run<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin + Send,
    {
        let id = self.handle.id();
        let max_frame_len = self.ctx.config.max_frame_len;
        let mut closing = self.handle.closed_signal();

        loop {
            if *closing.borrow() {
                debug!(conn = id, "Close requested");
                break;
            }

            let next = tokio::select! {
                _ = closing.changed() => continue,
                next = read_envelope(&mut reader, max_frame_len) => next,
            };

            match next {
                Ok(Some(envelope)) => {
                    if let Err(e) = self.dispatch(envelope).await {
                        warn!(conn = id, error = %e, "Reply failed, closing connection");
                        break;
                    }
                }
                Ok(None) => {
                    debug!(conn = id, "Peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(conn = id, peer = %self.handle.peer(), error = %e, "Protocol error, closing connection");
                    self.ctx.events.emit(ServerEvent::Error {
                        message: format!("connection {id}: {e}"),
                    });
                    break;
                }
            }
        }

        self.finalize().await;
    }

    async fn dispatch(&self, envelope: Envelope) -> ProtocolResult<()> {
        match envelope {
            Envelope::Identity(identity) => {
                self.on_identity(identity);
                Ok(())
            }
            Envelope::Text(text) => self.on_text(text).await,
            Envelope::File(file) => {
                self.on_file(file).await;
                Ok(())
            }
            Envelope::KeyExchange(exchange) => {
                let id = self.handle.id();
                info!(conn = id, key = %exchange.key, "Key exchange");
                self.ctx.events.emit(ServerEvent::KeyExchangeReceived {
                    id,
                    key: exchange.key.clone(),
                });
                self.handle.send(&Envelope::KeyExchange(exchange)).await
            }
            Envelope::PhrasePositions(_) => {
                debug!(conn = self.handle.id(), "Ignoring phrase positions sent by a client");
                Ok(())
            }
        }
    }

    fn on_identity(&self, identity: Identity) {
        let id = self.handle.id();
        if !self.handle.attach_identity(identity.clone()) {
            warn!(conn = id, identity = %identity, "Connection already identified, ignoring");
            return;
        }
        info!(conn = id, identity = %identity, "Connection identified");
        self.ctx
            .events
            .emit(ServerEvent::IdentityReceived { id, identity });
    }

    async fn on_text(&self, mut text: TextPayload) -> ProtocolResult<()> {
        let id = self.handle.id();
        if text.sender.is_none() {
            text.sender = self.handle.identity();
        }

        let decrypted = text.decrypt();
        let positions: Vec<u32> = find_positions(&decrypted, &self.ctx.phrase)
            .into_iter()
            .filter_map(|index| u32::try_from(index).ok())
            .collect();
        info!(conn = id, message = %decrypted, matches = positions.len(), "Text received");
        self.ctx.events.emit(ServerEvent::MessageReceived {
            id,
            message: decrypted.clone(),
        });

        let reply = PhrasePositionsPayload {
            phrase: self.ctx.config.search_phrase.clone(),
            positions: positions.clone(),
        };
        self.handle.send(&Envelope::PhrasePositions(reply)).await?;

        if self.ctx.config.relay_text {
            let relayed = TextPayload {
                ciphertext: text.ciphertext.clone(),
                key: text.key.clone(),
                sender: text.sender.clone(),
                decrypted: None,
                positions: None,
            };
            let delivered = self
                .ctx
                .registry
                .broadcast(&Envelope::Text(relayed), Some(id))
                .await;
            debug!(conn = id, delivered, "Relayed text");
        }

        text.decrypted = Some(decrypted);
        text.positions = Some(positions);
        self.persist_text(text).await;
        Ok(())
    }

    async fn persist_text(&self, text: TextPayload) {
        let record = MessageRecord {
            connection_tag: self.handle.tag(),
            sender: text.sender,
            ciphertext: text.ciphertext,
            key: text.key,
            decrypted: text.decrypted.unwrap_or_default(),
            positions: text.positions.unwrap_or_default(),
            timestamp_ms: now_millis(),
        };
        if let Err(e) = self.ctx.messages.save_message(record).await {
            warn!(conn = self.handle.id(), error = %e, "Failed to persist message");
            self.ctx.events.emit(ServerEvent::Error {
                message: format!("message not saved: {e}"),
            });
        }
    }

    async fn on_file(&self, mut file: FilePayload) {
        let id = self.handle.id();
        if file.sender.is_none() {
            file.sender = self.handle.identity();
        }
        info!(conn = id, name = %file.name, size = file.declared_len, category = %file.category, "File received");
        self.ctx.events.emit(ServerEvent::FileReceived {
            id,
            name: file.name.clone(),
            size: file.declared_len,
            category: file.category,
        });

        let location = match self.ctx.files.store(&file.name, &file.data).await {
            Ok(location) => location,
            Err(e) => {
                warn!(conn = id, name = %file.name, error = %e, "Failed to store file");
                self.ctx.events.emit(ServerEvent::Error {
                    message: format!("file {} not saved: {e}", file.name),
                });
                return;
            }
        };

        let record = FileRecord {
            connection_tag: self.handle.tag(),
            sender: file.sender,
            name: file.name,
            size: file.declared_len,
            category: file.category,
            location,
            timestamp_ms: now_millis(),
        };
        if let Err(e) = self.ctx.messages.save_file(record).await {
            warn!(conn = id, error = %e, "Failed to persist file metadata");
        }
    }

    async fn finalize(self) {
        if !self.handle.mark_finalized() {
            return;
        }
        let id = self.handle.id();
        let peer = self.handle.peer();

        self.handle.close_transport().await;
        self.ctx.registry.remove(id).await;

        info!(conn = id, peer = %peer, "Client disconnected");
        self.ctx
            .events
            .emit(ServerEvent::ClientDisconnected { id, peer });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::events::EventNotifier;
    use crate::protocol::{write_envelope, MediaCategory, DEFAULT_MAX_FRAME_LEN};
    use crate::server::registry::ConnectionRegistry;
    use crate::store::{
        FileStore, MemoryFileStore, MemoryMessageStore, MessageStore, RecordId, StoreError,
        StoreResult, StoredMessage,
    };
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    struct BrokenStore;

    #[async_trait]
    impl MessageStore for BrokenStore {
        async fn save_message(&self, _record: MessageRecord) -> StoreResult<RecordId> {
            Err(StoreError::Unavailable("database down".to_string()))
        }

        async fn save_file(&self, _record: FileRecord) -> StoreResult<RecordId> {
            Err(StoreError::Unavailable("database down".to_string()))
        }

        async fn history(&self, _sender: Option<u64>, _limit: usize) -> StoreResult<Vec<StoredMessage>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        ctx: Arc<ServerContext>,
        messages: Arc<MemoryMessageStore>,
        files: Arc<MemoryFileStore>,
        events: mpsc::UnboundedReceiver<ServerEvent>,
    }

    fn fixture(config: ServerConfig) -> Fixture {
        fixture_with(config, None)
    }

    fn fixture_with(config: ServerConfig, store: Option<Arc<dyn MessageStore>>) -> Fixture {
        let messages = Arc::new(MemoryMessageStore::new());
        let files = Arc::new(MemoryFileStore::new());
        let notifier = EventNotifier::new();
        let (_, events) = notifier.subscribe_channel();
        let message_store: Arc<dyn MessageStore> =
            store.unwrap_or_else(|| messages.clone() as Arc<dyn MessageStore>);
        let ctx = Arc::new(ServerContext::new(
            config,
            Arc::new(ConnectionRegistry::new()),
            notifier,
            message_store,
            files.clone() as Arc<dyn FileStore>,
        ));
        Fixture {
            ctx,
            messages,
            files,
            events,
        }
    }

    async fn open(ctx: &Arc<ServerContext>, port: u16) -> (Arc<ConnectionHandle>, DuplexStream, JoinHandle<()>) {
        let (server_side, client_side) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server_side);
        let peer = SocketAddr::from(([127, 0, 0, 1], port));
        let handle = ctx.registry.register(peer, Box::new(writer)).await;
        let task = tokio::spawn(ConnectionHandler::new(Arc::clone(ctx), Arc::clone(&handle)).run(reader));
        (handle, client_side, task)
    }

    async fn recv(client: &mut DuplexStream) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), read_envelope(client, DEFAULT_MAX_FRAME_LEN))
            .await
            .expect("reply in time")
            .unwrap()
            .expect("frame")
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<ServerEvent>,
        pred: impl Fn(&ServerEvent) -> bool,
    ) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("notifier alive");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event in time")
    }

    fn phrase_config(phrase: &str) -> ServerConfig {
        ServerConfig {
            search_phrase: phrase.to_string(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_key_exchange_is_echoed() {
        let mut fx = fixture(ServerConfig::default());
        let (handle, mut client, _task) = open(&fx.ctx, 1000).await;

        write_envelope(&mut client, &Envelope::key_exchange("TESTKEY")).await.unwrap();
        assert_eq!(recv(&mut client).await, Envelope::key_exchange("TESTKEY"));

        let event = wait_for(&mut fx.events, |e| matches!(e, ServerEvent::KeyExchangeReceived { .. })).await;
        assert_eq!(
            event,
            ServerEvent::KeyExchangeReceived {
                id: handle.id(),
                key: "TESTKEY".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_text_is_searched_answered_and_persisted() {
        let fx = fixture(phrase_config("WORLD"));
        let (handle, mut client, _task) = open(&fx.ctx, 1000).await;

        write_envelope(&mut client, &Envelope::Identity(Identity::new(9, "alice")))
            .await
            .unwrap();
        let text = TextPayload::encrypt("hello world", "TESTKEY");
        write_envelope(&mut client, &Envelope::Text(text.clone())).await.unwrap();

        let Envelope::PhrasePositions(reply) = recv(&mut client).await else {
            panic!("expected phrase positions");
        };
        assert_eq!(reply.phrase, "WORLD");
        assert_eq!(reply.positions, vec![7]);
        assert_eq!(handle.identity(), Some(Identity::new(9, "alice")));

        // Persistence happens after the reply
        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.messages.message_count().await == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let history = fx.messages.history(Some(9), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        let record = &history[0].record;
        assert_eq!(record.decrypted, "HELXLOZWORLD");
        assert_eq!(record.ciphertext, text.ciphertext);
        assert_eq!(record.positions, vec![7]);
        assert_eq!(record.connection_tag, "127.0.0.1:1000");
    }

    #[tokio::test]
    async fn test_default_phrase_not_found() {
        let fx = fixture(ServerConfig::default());
        let (_handle, mut client, _task) = open(&fx.ctx, 1000).await;

        write_envelope(&mut client, &Envelope::Text(TextPayload::encrypt("hello", "K")))
            .await
            .unwrap();
        let Envelope::PhrasePositions(reply) = recv(&mut client).await else {
            panic!("expected phrase positions");
        };
        assert_eq!(reply.to_string(), "Not found");

        write_envelope(
            &mut client,
            &Envelope::Text(TextPayload::encrypt("xin chào bạn, xin chào", "K")),
        )
        .await
        .unwrap();
        let Envelope::PhrasePositions(reply) = recv(&mut client).await else {
            panic!("expected phrase positions");
        };
        assert_eq!(reply.positions.len(), 2);
        assert_eq!(reply.positions[0], 0);
    }

    #[tokio::test]
    async fn test_text_relayed_to_other_connections() {
        let fx = fixture(ServerConfig::default());
        let (_a, mut alice, _ta) = open(&fx.ctx, 1000).await;
        let (_b, mut bob, _tb) = open(&fx.ctx, 1001).await;

        let text = TextPayload::encrypt("meet at noon", "SHARED");
        write_envelope(&mut alice, &Envelope::Text(text.clone())).await.unwrap();

        assert!(matches!(recv(&mut alice).await, Envelope::PhrasePositions(_)));
        assert_eq!(recv(&mut bob).await, Envelope::Text(text));
    }

    #[tokio::test]
    async fn test_relay_disabled() {
        let config = ServerConfig {
            relay_text: false,
            ..ServerConfig::default()
        };
        let fx = fixture(config);
        let (_a, mut alice, _ta) = open(&fx.ctx, 1000).await;
        let (_b, mut bob, _tb) = open(&fx.ctx, 1001).await;

        write_envelope(&mut alice, &Envelope::Text(TextPayload::encrypt("quiet", "K")))
            .await
            .unwrap();
        assert!(matches!(recv(&mut alice).await, Envelope::PhrasePositions(_)));

        // Bob only sees his own key echo, nothing relayed before it
        write_envelope(&mut bob, &Envelope::key_exchange("BOB")).await.unwrap();
        assert_eq!(recv(&mut bob).await, Envelope::key_exchange("BOB"));
    }

    #[tokio::test]
    async fn test_file_is_stored_without_reply() {
        let mut fx = fixture(ServerConfig::default());
        let (_handle, mut client, _task) = open(&fx.ctx, 1000).await;

        let file = FilePayload::new("cat.png", vec![1, 2, 3, 4]);
        write_envelope(&mut client, &Envelope::File(file)).await.unwrap();

        let event = wait_for(&mut fx.events, |e| matches!(e, ServerEvent::FileReceived { .. })).await;
        assert!(matches!(
            event,
            ServerEvent::FileReceived {
                size: 4,
                category: MediaCategory::Image,
                ..
            }
        ));

        // The next reply on the wire belongs to the key exchange
        write_envelope(&mut client, &Envelope::key_exchange("K")).await.unwrap();
        assert_eq!(recv(&mut client).await, Envelope::key_exchange("K"));

        let records = fx.messages.files().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "cat.png");
        assert_eq!(fx.files.get(&records[0].location).await.unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_second_identity_is_ignored() {
        let mut fx = fixture(ServerConfig::default());
        let (handle, mut client, _task) = open(&fx.ctx, 1000).await;

        write_envelope(&mut client, &Envelope::Identity(Identity::new(1, "alice")))
            .await
            .unwrap();
        write_envelope(&mut client, &Envelope::Identity(Identity::new(2, "mallory")))
            .await
            .unwrap();
        write_envelope(&mut client, &Envelope::key_exchange("K")).await.unwrap();
        recv(&mut client).await;

        assert_eq!(handle.identity(), Some(Identity::new(1, "alice")));
        wait_for(&mut fx.events, |e| matches!(e, ServerEvent::IdentityReceived { .. })).await;
        assert!(fx.ctx.registry.get(handle.id()).await.is_some());
    }

    #[tokio::test]
    async fn test_store_failure_keeps_connection() {
        let mut fx = fixture_with(ServerConfig::default(), Some(Arc::new(BrokenStore)));
        let (handle, mut client, _task) = open(&fx.ctx, 1000).await;

        write_envelope(&mut client, &Envelope::Text(TextPayload::encrypt("hi", "K")))
            .await
            .unwrap();
        assert!(matches!(recv(&mut client).await, Envelope::PhrasePositions(_)));

        wait_for(&mut fx.events, |e| matches!(e, ServerEvent::Error { .. })).await;
        write_envelope(&mut client, &Envelope::key_exchange("STILL")).await.unwrap();
        assert_eq!(recv(&mut client).await, Envelope::key_exchange("STILL"));
        assert!(fx.ctx.registry.get(handle.id()).await.is_some());
    }

    #[tokio::test]
    async fn test_protocol_error_finalizes_once() {
        let mut fx = fixture(ServerConfig::default());
        let (handle, mut client, task) = open(&fx.ctx, 1000).await;

        tokio::io::AsyncWriteExt::write_all(&mut client, &[1, 99, 0, 0, 0, 0])
            .await
            .unwrap();
        task.await.unwrap();

        assert!(fx.ctx.registry.is_empty().await);
        assert!(read_envelope(&mut client, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap()
            .is_none());

        let mut disconnects = 0;
        while let Ok(event) = fx.events.try_recv() {
            if event == (ServerEvent::ClientDisconnected {
                id: handle.id(),
                peer: handle.peer(),
            }) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_close_request_stops_loop() {
        let fx = fixture(ServerConfig::default());
        let (handle, mut client, task) = open(&fx.ctx, 1000).await;

        handle.request_close();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert!(fx.ctx.registry.is_empty().await);
        assert!(read_envelope(&mut client, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_peer_close_finalizes() {
        let fx = fixture(ServerConfig::default());
        let (_handle, client, task) = open(&fx.ctx, 1000).await;
        drop(client);
        task.await.unwrap();
        assert!(fx.ctx.registry.is_empty().await);
    }
}

//! End-to-end tests against a relay on an ephemeral loopback port

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cipherchat::protocol::{KeyExchangePayload, PhrasePositionsPayload, TextPayload};
use cipherchat::session::DisconnectReason;
use cipherchat::store::{MemoryFileStore, MemoryMessageStore, MessageStore};
use cipherchat::{
    ConnectError, Identity, RunningServer, Server, ServerConfig, ServerEvent, Session,
    SessionError, SessionHandler, SessionState,
};
use tokio::sync::mpsc;

#[derive(Debug, PartialEq)]
enum Inbound {
    Text(TextPayload),
    Positions(PhrasePositionsPayload),
    Key(String),
    Closed(DisconnectReason),
}

struct Collector(mpsc::UnboundedSender<Inbound>);

impl SessionHandler for Collector {
    fn on_text(&self, text: TextPayload) {
        let _ = self.0.send(Inbound::Text(text));
    }

    fn on_phrase_positions(&self, result: PhrasePositionsPayload) {
        let _ = self.0.send(Inbound::Positions(result));
    }

    fn on_key_exchange(&self, exchange: KeyExchangePayload) {
        let _ = self.0.send(Inbound::Key(exchange.key));
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        let _ = self.0.send(Inbound::Closed(reason.clone()));
    }
}

struct Client {
    session: Session,
    inbox: mpsc::UnboundedReceiver<Inbound>,
}

impl Client {
    async fn connect(addr: SocketAddr, identity: Option<Identity>) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        let session = Session::new(Arc::new(Collector(tx)));
        session.set_identity(identity);
        session.connect(&addr.to_string()).await.unwrap();
        Client { session, inbox }
    }

    async fn next(&mut self) -> Inbound {
        tokio::time::timeout(Duration::from_secs(5), self.inbox.recv())
            .await
            .expect("inbound frame in time")
            .expect("session alive")
    }
}

async fn start_relay(phrase: &str) -> (RunningServer, Arc<MemoryMessageStore>) {
    let messages = Arc::new(MemoryMessageStore::new());
    let config = ServerConfig {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        search_phrase: phrase.to_string(),
        ..ServerConfig::default()
    };
    let running = Server::new(config)
        .with_message_store(messages.clone() as Arc<dyn MessageStore>)
        .with_file_store(Arc::new(MemoryFileStore::new()))
        .bind()
        .await
        .unwrap();
    (running, messages)
}

#[tokio::test]
async fn key_exchange_then_text_returns_positions() {
    let (relay, messages) = start_relay("WORLD").await;
    let mut alice = Client::connect(relay.local_addr(), Some(Identity::new(1, "alice"))).await;

    alice.session.send_key_exchange("TESTKEY").await.unwrap();
    assert_eq!(alice.next().await, Inbound::Key("TESTKEY".to_string()));

    let sent = alice.session.send_message("hello world").await.unwrap();
    assert_eq!(sent.key, "TESTKEY");
    assert_eq!(sent.decrypt(), "HELXLOZWORLD");

    let Inbound::Positions(result) = alice.next().await else {
        panic!("expected phrase positions");
    };
    assert_eq!(result.phrase, "WORLD");
    assert_eq!(result.positions, vec![7]);
    assert_eq!(result.to_string(), "[7]");

    alice.session.disconnect().await;
    assert_eq!(alice.next().await, Inbound::Closed(DisconnectReason::Local));

    relay.shutdown().await;
    let history = messages.history(Some(1), 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].record.decrypted, "HELXLOZWORLD");
}

#[tokio::test]
async fn text_is_relayed_to_other_clients() {
    let (relay, _messages) = start_relay("xin chào").await;
    let mut alice = Client::connect(relay.local_addr(), Some(Identity::new(1, "alice"))).await;
    let mut bob = Client::connect(relay.local_addr(), None).await;

    // Both connections are registered once each has had a reply
    bob.session.send_key_exchange("SHARED").await.unwrap();
    assert_eq!(bob.next().await, Inbound::Key("SHARED".to_string()));
    alice.session.send_key_exchange("SHARED").await.unwrap();
    assert_eq!(alice.next().await, Inbound::Key("SHARED".to_string()));

    let sent = alice.session.send_message("xin chào bob").await.unwrap();

    let Inbound::Positions(result) = alice.next().await else {
        panic!("expected phrase positions");
    };
    assert_eq!(result.positions, vec![0]);

    let Inbound::Text(relayed) = bob.next().await else {
        panic!("expected relayed text");
    };
    assert_eq!(relayed.ciphertext, sent.ciphertext);
    assert_eq!(relayed.sender, Some(Identity::new(1, "alice")));
    assert_eq!(relayed.decrypted, None);
    assert_eq!(relayed.decrypt(), "XINZCHAOZBOB");

    relay.shutdown().await;
}

#[tokio::test]
async fn shutdown_disconnects_clients() {
    let (relay, _messages) = start_relay("xin chào").await;
    let (_, mut events) = relay.events().subscribe_channel();
    let mut alice = Client::connect(relay.local_addr(), None).await;

    alice.session.send_key_exchange("K").await.unwrap();
    assert_eq!(alice.next().await, Inbound::Key("K".to_string()));

    relay.shutdown().await;
    assert_eq!(
        alice.next().await,
        Inbound::Closed(DisconnectReason::RemoteClosed)
    );
    assert_eq!(alice.session.state(), SessionState::Disconnected);

    let mut stopped = false;
    while let Ok(event) = events.try_recv() {
        stopped |= event == ServerEvent::ServerStopped;
    }
    assert!(stopped);
}

#[tokio::test]
async fn connect_to_closed_port_is_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let session = Session::new(Arc::new(()));
    let err = session.connect(&addr.to_string()).await.unwrap_err();
    assert!(matches!(err, SessionError::Connect(ConnectError::Refused(_))));
    assert!(err.to_string().contains("refused"));
    assert_eq!(session.state(), SessionState::Disconnected);
}

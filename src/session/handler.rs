//! Callbacks for inbound frames on a client session

use std::fmt;

use tracing::debug;

use crate::protocol::{
    Envelope, FilePayload, KeyExchangePayload, PhrasePositionsPayload, TextPayload,
};

/// Why a session left the connected state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`Session::disconnect`](super::Session::disconnect) was called
    Local,
    /// The server closed the stream between frames
    RemoteClosed,
    /// The stream failed or carried a bad frame
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Local => f.write_str("disconnected"),
            DisconnectReason::RemoteClosed => f.write_str("server closed the connection"),
            DisconnectReason::Error(e) => write!(f, "connection lost: {e}"),
        }
    }
}

/// Receiver of frames decoded by a session's receive loop
///
/// Every method runs on the receive task and defaults to doing nothing, so
/// implementors only override the kinds they care about.
pub trait SessionHandler: Send + Sync {
    /// A text message, either relayed from another client or echoed back
    fn on_text(&self, _text: TextPayload) {}

    /// Phrase search result for a text this client sent
    fn on_phrase_positions(&self, _result: PhrasePositionsPayload) {}

    /// Key confirmation from the server
    fn on_key_exchange(&self, _exchange: KeyExchangePayload) {}

    /// A file pushed by the server
    fn on_file(&self, _file: FilePayload) {}

    /// The session is no longer connected
    fn on_disconnected(&self, _reason: &DisconnectReason) {}
}

impl SessionHandler for () {}

pub(super) fn dispatch(handler: &dyn SessionHandler, envelope: Envelope) {
    match envelope {
        Envelope::Text(text) => handler.on_text(text),
        Envelope::PhrasePositions(result) => handler.on_phrase_positions(result),
        Envelope::KeyExchange(exchange) => handler.on_key_exchange(exchange),
        Envelope::File(file) => handler.on_file(file),
        Envelope::Identity(identity) => {
            debug!(identity = %identity, "Ignoring identity frame from server");
        }
    }
}

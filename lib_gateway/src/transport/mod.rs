//! # Relay Transport
//!
//! The connection manager drives exactly one outbound relay session at a
//! time through the `Transport` trait: `connect` resolves, dials, and (for
//! `wss://` endpoints) completes TLS, then hands back a `SessionHandle` — an
//! ordered event stream plus a frame sink. Everything after the dial
//! surfaces on the event stream, in transport arrival order.
//!
//! The production implementation lives in [`ws`] on top of
//! `tokio-tungstenite`; tests script sessions over bare channels.

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod ws;

/// Errors surfaced by the dial phase. Post-connect failures arrive as
/// [`TransportEvent::Error`] / [`TransportEvent::Closed`] instead.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("connect failed: {0}")]
    Connect(String),
}

/// Events surfaced by a live session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake complete; the session is live.
    Connected,
    Text(String),
    Binary(Vec<u8>),
    /// Byte-level failure; the session is dead after this.
    Error(String),
    /// Orderly close, with the peer's reason when one was given.
    Closed(Option<String>),
}

/// An outbound frame handed to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Orderly close request.
    Close,
}

/// A live session: dropping the handle tears the session down.
pub struct SessionHandle {
    /// Inbound events, delivered in the order the transport produced them.
    pub events: mpsc::Receiver<TransportEvent>,
    /// Outbound frames, sent in FIFO order within this session.
    pub frames: mpsc::Sender<Frame>,
}

/// Factory for relay sessions. Object-safe so the state machine can hold it
/// as `Arc<dyn Transport>` and tests can substitute scripted sessions.
pub trait Transport: Send + Sync {
    /// Opens a session to `url`. DNS, TCP, and TLS failures surface here;
    /// the WebSocket-level `Connected` event arrives on the handle.
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<SessionHandle, TransportError>>;
}

//! WebSocket transport over `tokio-tungstenite`. The pump task bridges the
//! split stream halves onto the session channels and dies with them.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

use crate::transport::{Frame, SessionHandle, Transport, TransportError, TransportEvent};

/// Depth of the per-session bridge channels.
const CHANNEL_DEPTH: usize = 64;

/// Production transport: one `connect_async` dial per session.
#[derive(Debug, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<SessionHandle, TransportError>> {
        let url = url.to_string();
        Box::pin(async move {
            let parsed =
                url::Url::parse(&url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
            let (ws_stream, _) = connect_async(parsed.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;

            let (events_tx, events_rx) = mpsc::channel(CHANNEL_DEPTH);
            let (frames_tx, frames_rx) = mpsc::channel(CHANNEL_DEPTH);
            tokio::spawn(pump(ws_stream, events_tx, frames_rx));

            Ok(SessionHandle {
                events: events_rx,
                frames: frames_tx,
            })
        })
    }
}

async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    events: mpsc::Sender<TransportEvent>,
    mut frames: mpsc::Receiver<Frame>,
) {
    let (mut write, mut read) = ws_stream.split();

    // The upgrade already completed inside connect_async; surface it as the
    // first event so the state machine sees one uniform stream.
    if events.send(TransportEvent::Connected).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(Frame::Text(text)) => {
                        if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                            log::error!("[cloud] ws send failed: {}", e);
                            let _ = events.send(TransportEvent::Error(e.to_string())).await;
                            break;
                        }
                    }
                    Some(Frame::Binary(data)) => {
                        if let Err(e) = write.send(WsMessage::Binary(data.into())).await {
                            log::error!("[cloud] ws send failed: {}", e);
                            let _ = events.send(TransportEvent::Error(e.to_string())).await;
                            break;
                        }
                    }
                    Some(Frame::Close) | None => {
                        // Handle dropped or explicit close: orderly shutdown.
                        let _ = write.close().await;
                        let _ = events.send(TransportEvent::Closed(None)).await;
                        break;
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if events.send(TransportEvent::Text(text.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        if events.send(TransportEvent::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = events.send(TransportEvent::Closed(reason)).await;
                        break;
                    }
                    Some(Ok(_)) => {
                        // Protocol-level ping/pong stays below the
                        // application heartbeat.
                    }
                    Some(Err(e)) => {
                        let _ = events.send(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = events.send(TransportEvent::Closed(None)).await;
                        break;
                    }
                }
            }
        }
    }
}

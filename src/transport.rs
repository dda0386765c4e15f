//! Transport seam
//!
//! The core is transport-agnostic: anything that can send text frames,
//! yield inbound frames in order, and surface a distinguishable close
//! condition can carry OCPP traffic. Production uses WebSockets; tests and
//! embeddings use the in-memory pair.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::warn;

use crate::support::{OcppError, OcppResult};

/// Bidirectional message channel over a persistent connection.
///
/// `recv` returning `None` means the peer closed the connection; an inner
/// `Err` is a transport fault that the caller treats the same way.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> OcppResult<()>;
    async fn recv(&mut self) -> Option<OcppResult<String>>;
    async fn close(&mut self);
}

// ── WebSocket ──────────────────────────────────────────────────

/// WebSocket-backed transport (server- or client-side stream).
pub struct WsTransport<S> {
    ws: WebSocketStream<S>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: String) -> OcppResult<()> {
        self.ws
            .send(Message::Text(frame))
            .await
            .map_err(|e| OcppError::Connection(format!("websocket send failed: {}", e)))
    }

    async fn recv(&mut self) -> Option<OcppResult<String>> {
        while let Some(msg) = self.ws.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Binary(data)) => {
                    warn!(bytes = data.len(), "Ignoring binary websocket message");
                }
                Ok(Message::Close(_)) => return None,
                Err(e) => {
                    return Some(Err(OcppError::Connection(format!(
                        "websocket receive failed: {}",
                        e
                    ))))
                }
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ── In-memory ──────────────────────────────────────────────────

/// Channel-backed transport. `pair()` yields two connected endpoints.
pub struct InMemoryTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl InMemoryTransport {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&mut self, frame: String) -> OcppResult<()> {
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| OcppError::Connection("peer endpoint dropped".into())),
            None => Err(OcppError::Connection("transport closed".into())),
        }
    }

    async fn recv(&mut self) -> Option<OcppResult<String>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_both_ways() {
        let (mut a, mut b) = InMemoryTransport::pair();
        a.send("ping".into()).await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap(), "ping");
        b.send("pong".into()).await.unwrap();
        assert_eq!(a.recv().await.unwrap().unwrap(), "pong");
    }

    #[tokio::test]
    async fn close_is_visible_to_peer() {
        let (mut a, mut b) = InMemoryTransport::pair();
        a.close().await;
        assert!(b.recv().await.is_none());
        assert!(a.send("late".into()).await.is_err());
    }
}

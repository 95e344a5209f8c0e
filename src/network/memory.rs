//! In-process transport
//!
//! Pairs a session with a scripted peer over channels. Each `connect` on a
//! `MemoryConnector` hands a fresh `MemoryPeer` to the matching
//! `MemoryListener`.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::transport::{
    Connector, FrameSink, FrameStream, InboundFrame, Transport, TransportError, TransportResult,
};
use crate::protocol::{self, Message};

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// Receives the server side of every connection made through the connector
#[derive(Debug)]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (Self { accept_tx }, MemoryListener { accept_rx })
    }
}

impl MemoryListener {
    /// Wait for the next connection. Returns None once the connector is gone.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> TransportResult<Transport> {
        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            url: url.to_string(),
            rx: to_peer_rx,
            tx: to_client_tx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::Refused(url.to_string()))?;

        Ok(Transport::new(
            MemorySink {
                tx: to_peer_tx,
                closed: false,
            },
            MemoryStream { rx: to_client_rx },
        ))
    }
}

struct MemorySink {
    tx: mpsc::UnboundedSender<InboundFrame>,
    closed: bool,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(InboundFrame::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.tx
            .send(InboundFrame::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| TransportError::Closed)
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<InboundFrame>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Option<TransportResult<InboundFrame>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Server side of an in-process connection
#[derive(Debug)]
pub struct MemoryPeer {
    url: String,
    rx: mpsc::UnboundedReceiver<InboundFrame>,
    tx: mpsc::UnboundedSender<InboundFrame>,
}

impl MemoryPeer {
    /// URL the client dialed
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(InboundFrame::Text(text.into())).is_ok()
    }

    pub fn send(&self, message: &Message) -> bool {
        match protocol::encode(message) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                tracing::warn!("Memory peer failed to encode message: {}", e);
                false
            }
        }
    }

    /// Send a close frame to the client
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.tx
            .send(InboundFrame::Close {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }

    /// Next raw frame from the client
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        self.rx.recv().await
    }

    /// Next decodable message from the client, skipping close frames
    /// and undecodable text. Returns None once the client is gone.
    pub async fn recv_message(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await? {
                InboundFrame::Text(text) => match protocol::decode(&text) {
                    Ok(message) => return Some(message),
                    Err(e) => tracing::warn!("Memory peer received bad frame: {}", e),
                },
                InboundFrame::Close { .. } => return None,
            }
        }
    }
}

//! Transport abstraction
//!
//! The session consumes an already-framed message channel split into a
//! sink and a stream half. `WsConnector` provides the default websocket
//! implementation on top of `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{close_code, SUBPROTOCOL};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A frame delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// UTF-8 text frame
    Text(String),
    /// Close frame with status code and reason
    Close { code: u16, reason: String },
}

/// Write half of a transport
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> TransportResult<()>;

    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()>;
}

/// Read half of a transport. `None` means the stream ended without a close frame.
#[async_trait]
pub trait FrameStream: Send {
    async fn recv(&mut self) -> Option<TransportResult<InboundFrame>>;
}

/// An opened transport, split into halves
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl Transport {
    pub fn new(sink: impl FrameSink + 'static, stream: impl FrameStream + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            stream: Box::new(stream),
        }
    }
}

/// Opens transports for a URL
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> TransportResult<Transport>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket connector requesting the JSON subprotocol
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> TransportResult<Transport> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        tracing::debug!("Opening websocket to {}", url);
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (sink, stream) = ws_stream.split();

        Ok(Transport::new(WsSink { sink }, WsFrameStream { stream }))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.sink.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.sink.send(WsMessage::Close(Some(frame))).await?;
        self.sink.close().await?;
        Ok(())
    }
}

struct WsFrameStream {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn recv(&mut self) -> Option<TransportResult<InboundFrame>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(InboundFrame::Text(text))),
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(InboundFrame::Text(text))),
                    Err(_) => tracing::warn!("Dropping non UTF-8 binary frame"),
                },
                Ok(WsMessage::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(InboundFrame::Close { code, reason }));
                }
                // Pings are answered by tungstenite itself
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
                Err(tungstenite::Error::ConnectionClosed) => {
                    return Some(Ok(InboundFrame::Close {
                        code: close_code::NORMAL,
                        reason: String::new(),
                    }));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

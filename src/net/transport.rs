//! Byte-level transport beneath the STOMP connection.
//!
//! SYSTEM CONTEXT
//! ==============
//! The connection manager speaks STOMP text over a [`Transport`] obtained from
//! a [`Connector`]. Production uses [`WsConnector`] (websocket via
//! `tokio-tungstenite`); tests substitute an in-memory connector.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::ChatError;

/// One open, bidirectional text channel to the broker.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Write one text message.
    async fn send(&mut self, text: String) -> Result<(), ChatError>;

    /// Next inbound text message; `None` once the peer has closed.
    ///
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Option<Result<String, ChatError>>;

    /// Release the channel. Best-effort; errors are swallowed.
    async fn close(&mut self);
}

/// Opens transports to the broker endpoint.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ChatError>;
}

/// Websocket connector for `ws://` and `wss://` broker endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ChatError> {
        let (stream, _) = connect_async(url).await?;
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), ChatError> {
        self.stream.send(Message::text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, ChatError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(err.into())),
            };
            match message {
                Message::Text(text) => return Some(Ok(text.as_str().to_owned())),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => return Some(Err(frames::CodecError::InvalidUtf8.into())),
                },
                Message::Close(_) => return None,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            tracing::debug!(error = %err, "websocket close failed");
        }
    }
}

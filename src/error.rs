//! Client error type.
//!
//! ERROR HANDLING
//! ==============
//! History and identity failures are returned to the caller and block the
//! room. Transport failures never reach the caller directly: the connection
//! task absorbs them into its reconnect loop and reports connection state
//! instead. `retryable` is the classification that loop relies on.

use crate::net::connection::ConnectionState;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// A configuration value is present but unusable.
    #[error("config parse failed: {0}")]
    ConfigParse(String),

    /// Local I/O failed (runtime startup, terminal input).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// No bearer token is available for the session.
    #[error("login required: no session token")]
    LoginRequired,

    /// The HTTP request to the chat backend failed before a response arrived.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The chat backend answered with a non-success status.
    #[error("{endpoint} returned status {status}")]
    HttpStatus { endpoint: String, status: u16 },

    /// A response or frame body did not match the chat protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] frames::chat::ProtocolError),

    /// A STOMP frame could not be decoded.
    #[error("frame decode failed: {0}")]
    Codec(#[from] frames::CodecError),

    /// The websocket transport failed.
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// The broker refused the STOMP handshake.
    #[error("broker rejected connection: {0}")]
    BrokerRejected(String),

    /// The broker closed the transport.
    #[error("connection closed by broker")]
    Closed,

    /// No inbound traffic within the negotiated heart-beat window.
    #[error("heart-beat timeout after {0} ms")]
    HeartbeatTimeout(u64),

    /// A network operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// No room has been resolved for the view yet.
    #[error("chat room is not available")]
    RoomUnavailable,

    /// Sending requires a live broker connection.
    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// Empty or whitespace-only input.
    #[error("message is empty")]
    EmptyMessage,

    /// The previous local send has not been confirmed or timed out yet.
    #[error("previous message is still awaiting confirmation")]
    SendInFlight,
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl ChatError {
    /// Whether reconnecting may succeed where this error occurred.
    #[must_use]
    pub fn retryable(&self) -> bool {
        if let Self::WebSocket(err) = self {
            // A malformed broker URL will not fix itself.
            return !matches!(
                **err,
                tokio_tungstenite::tungstenite::Error::Url(_) | tokio_tungstenite::tungstenite::Error::HttpFormat(_)
            );
        }
        matches!(
            self,
            Self::Http(_)
                | Self::HttpStatus { status: 429 | 500..=599, .. }
                | Self::BrokerRejected(_)
                | Self::Closed
                | Self::HeartbeatTimeout(_)
                | Self::Timeout(_)
        )
    }
}

#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use crate::error::Kind;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The opening handshake did not complete within the configured timeout
    Timeout(Duration),
    /// WebSocket connection was closed
    ConnectionClosed,
    /// The transport refused to open the connection
    ConnectFailed(String),
    /// The transport refused to send a message
    SendFailed(String),
    /// Subscription stream lagged and missed messages
    Lagged {
        /// Number of messages that were missed
        count: u64,
    },
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Timeout(after) => write!(f, "WebSocket connection timed out after {after:?}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::ConnectFailed(reason) => write!(f, "WebSocket connect failed: {reason}"),
            Self::SendFailed(reason) => write!(f, "WebSocket send failed: {reason}"),
            Self::Lagged { count } => write!(f, "Stream lagged, missed {count} messages"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        let kind = match e {
            WsError::Timeout(_) => Kind::Timeout,
            _ => Kind::WebSocket,
        };
        crate::error::Error::with_source(kind, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(Kind::WebSocket, WsError::Connection(e))
    }
}

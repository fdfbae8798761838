//! The transport seam the client is generic over.

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use super::config::Config;
use super::connection::ConnectionState;
use crate::Result;
use crate::error::Error;
use crate::types::{Message, Payload};

/// Bidirectional message transport driven by [`crate::client::Client`].
///
/// Implementations publish their connection state on a watch channel (emitting only on change),
/// inbound messages and transport errors on broadcast channels. A transport belongs to exactly one
/// client.
///
/// Contract:
/// - [`Transport::connect`] reports a failure on the error stream *and* returns it.
/// - [`Transport::send_message`] fails with a [`crate::error::Kind::State`] error when not connected.
/// - Calling [`Transport::connect`] while connected replaces the existing connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn config(&self) -> &Config;

    fn state(&self) -> ConnectionState;

    /// Receiver observing every state change. Duplicate states are never published.
    fn state_receiver(&self) -> watch::Receiver<ConnectionState>;

    fn subscribe_messages(&self) -> broadcast::Receiver<Message>;

    fn subscribe_errors(&self) -> broadcast::Receiver<Error>;

    async fn connect(&self) -> Result<()>;

    async fn send_message(&self, message: Message) -> Result<()>;

    /// Wrap `payload` in a [`Message`] tagged after its variant and send it.
    async fn send(&self, payload: Payload) -> Result<()> {
        self.send_message(Message::new(payload)).await
    }

    /// Close the connection with an optional close code and reason.
    async fn disconnect(&self, code: Option<u16>, reason: Option<String>) -> Result<()>;

    /// Tear down the connection and close every stream. Safe to call more than once.
    async fn dispose(&self);

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }
}

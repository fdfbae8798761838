#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message as Frame};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async, connect_async_tls_with_config,
};
use url::Url;

use super::config::Config;
use super::error::WsError;
use super::events::{EventSink, Logger};
use super::tls;
use super::traits::Transport;
use crate::Result;
use crate::error::Error;
use crate::types::{Message, Payload};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Frame>;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ConnectionState {
    /// Opening handshake in progress
    Connecting,
    /// Ready to send and receive
    Connected,
    /// Close handshake in progress
    Disconnecting,
    /// Not connected
    Disconnected,
    /// The last connect or read failed
    Error,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Publish `state` unless it is already current. Returns whether anything changed.
pub(crate) fn publish_state(tx: &watch::Sender<ConnectionState>, state: ConnectionState) -> bool {
    tx.send_if_modified(|current| {
        if *current == state {
            return false;
        }
        *current = state;
        true
    })
}

/// Decode an inbound text frame: JSON objects and arrays become [`Payload::Json`], anything else
/// stays text.
pub(crate) fn inbound_text(text: &str) -> Message {
    let trimmed = text.trim_start();
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && let Ok(value) = serde_json::from_str::<Value>(text)
    {
        return Message::json(value);
    }

    Message::text(text)
}

fn outbound_frame(payload: &Payload) -> Result<Frame> {
    Ok(match payload {
        Payload::Text(text) => Frame::text(text.clone()),
        Payload::Json(value) => Frame::text(serde_json::to_string(value)?),
        Payload::Binary(bytes) => Frame::binary(bytes.clone()),
    })
}

struct Shared {
    logger: Logger,
    state_tx: watch::Sender<ConnectionState>,
    messages: EventSink<Message>,
    errors: EventSink<Error>,
    writer: AsyncMutex<Option<WsSink>>,
    /// Bumped for every opened socket so a superseded reader leaves the new one alone.
    epoch: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        if publish_state(&self.state_tx, state) {
            self.logger.debug(format_args!("State changed to {state}"));
        }
    }

    fn report(&self, error: &Error) {
        self.errors.emit(error.clone());
    }

    async fn read_loop(self: Arc<Self>, mut read: SplitStream<WsStream>, epoch: u64) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Frame::Text(text)) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(text = text.as_str(), "Received WebSocket text message");
                    self.messages.emit(inbound_text(text.as_str()));
                }
                Ok(Frame::Binary(bytes)) => {
                    self.messages.emit(Message::binary(bytes.to_vec()));
                }
                Ok(Frame::Close(frame)) => {
                    match frame {
                        Some(frame) => self.logger.info(format_args!(
                            "Server closed connection ({}: {})",
                            u16::from(frame.code),
                            frame.reason.as_str()
                        )),
                        None => self.logger.info("Server closed connection"),
                    }
                    break;
                }
                Ok(_) => {
                    // Ping, pong and raw frames are handled by the socket itself.
                }
                Err(e) => {
                    if self.epoch.load(Ordering::SeqCst) != epoch {
                        return;
                    }
                    let error = Error::from(e);
                    self.logger.error(format_args!("Connection error: {error}"));
                    self.set_state(ConnectionState::Error);
                    self.report(&error);
                    break;
                }
            }
        }

        let mut writer = self.writer.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        writer.take();
        drop(writer);

        self.set_state(ConnectionState::Disconnected);
    }
}

/// Production [`Transport`] on `tokio-tungstenite`.
///
/// Each successful [`Transport::connect`] splits the socket: the write half is kept for sends and
/// the read half is drained by a background task that publishes inbound messages and moves the
/// state to [`ConnectionState::Disconnected`] when the server goes away.
pub struct WebSocketTransport {
    config: Config,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl WebSocketTransport {
    /// Create a transport that logs through `tracing` only.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let logger = Logger::detached("Transport", config.enable_logging);
        Self::with_logger(config, logger)
    }

    #[must_use]
    pub fn with_logger(config: Config, logger: Logger) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            shared: Arc::new(Shared {
                logger,
                state_tx,
                messages: EventSink::default(),
                errors: EventSink::default(),
                writer: AsyncMutex::new(None),
                epoch: AtomicU64::new(0),
            }),
            reader: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    fn request(&self) -> Result<Request> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let headers = request.headers_mut();

        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::validation(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::validation(format!("invalid value for header {name}: {e}")))?;
            headers.insert(name, value);
        }

        if !self.config.protocols.is_empty() {
            let protocols = HeaderValue::from_str(&self.config.protocols.join(", "))
                .map_err(|e| Error::validation(format!("invalid sub-protocol list: {e}")))?;
            headers.insert(SEC_WEBSOCKET_PROTOCOL, protocols);
        }

        Ok(request)
    }

    async fn open(&self, request: Request) -> Result<WsStream> {
        let url = Url::parse(&self.config.url)?;

        let stream = match &self.config.on_bad_certificate {
            Some(callback) if url.scheme() == "wss" => {
                let host = url.host_str().unwrap_or_default();
                let port = url.port_or_known_default().unwrap_or(443);
                let connector = Connector::Rustls(tls::client_config(callback, host, port)?);
                connect_async_tls_with_config(request, None, false, Some(connector))
                    .await?
                    .0
            }
            _ => connect_async(request).await?.0,
        };

        Ok(stream)
    }

    /// Drop the current socket without a close handshake.
    async fn release_socket(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }

        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            _ = writer.close().await;
        }
    }

    fn fail(&self, error: Error) -> Error {
        self.shared
            .logger
            .error(format_args!("Connection failed: {error}"));
        self.shared.set_state(ConnectionState::Error);
        self.shared.report(&error);
        error
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn config(&self) -> &Config {
        &self.config
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.shared.messages.subscribe()
    }

    fn subscribe_errors(&self) -> broadcast::Receiver<Error> {
        self.shared.errors.subscribe()
    }

    async fn connect(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::disposed());
        }

        if self.state().is_connected() {
            self.shared
                .logger
                .warn("Replacing existing connection");
        }
        self.release_socket().await;

        self.shared.set_state(ConnectionState::Connecting);
        self.shared
            .logger
            .info(format_args!("Connecting to {}", self.config.url));

        let request = self.request().map_err(|e| self.fail(e))?;
        let stream = match timeout(self.config.connection_timeout, self.open(request)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.fail(e)),
            Err(_elapsed) => {
                return Err(self.fail(WsError::Timeout(self.config.connection_timeout).into()));
            }
        };

        let (write, read) = stream.split();
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        *self.shared.writer.lock().await = Some(write);
        let reader = tokio::spawn(Arc::clone(&self.shared).read_loop(read, epoch));
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader);

        self.shared.set_state(ConnectionState::Connected);
        self.shared
            .logger
            .info(format_args!("Connected to {}", self.config.url));

        Ok(())
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        if !self.state().is_connected() {
            return Err(Error::not_connected());
        }

        let frame = outbound_frame(&message.payload)?;
        let mut writer = self.shared.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(Error::not_connected());
        };
        sink.send(frame).await?;

        self.shared
            .logger
            .debug(format_args!("Sent {} message", message.kind));
        Ok(())
    }

    async fn disconnect(&self, code: Option<u16>, reason: Option<String>) -> Result<()> {
        let state = self.state();
        if matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Disconnecting);
        self.shared.logger.info("Disconnecting");

        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let writer = self.shared.writer.lock().await.take();
        let mut result = Ok(());
        if let Some(mut writer) = writer {
            let frame = CloseFrame {
                code: code.map_or(CloseCode::Normal, CloseCode::from),
                reason: reason.unwrap_or_default().into(),
            };
            match writer.send(Frame::Close(Some(frame))).await {
                Ok(())
                | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {}
                Err(e) => result = Err(Error::from(e)),
            }
            _ = writer.close().await;
        }

        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }

        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.logger.info("Disconnected");

        result
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.disconnect(None, None).await {
            self.shared
                .logger
                .debug(format_args!("Close during dispose failed: {e}"));
        }
        self.release_socket().await;
        self.shared.messages.close();
        self.shared.errors.close();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(reader) = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::MessageType;

    #[test]
    fn state_publishes_only_changes() {
        let (tx, mut rx) = watch::channel(ConnectionState::Disconnected);
        rx.mark_unchanged();

        assert!(!publish_state(&tx, ConnectionState::Disconnected));
        assert!(!rx.has_changed().unwrap());

        assert!(publish_state(&tx, ConnectionState::Connecting));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connecting);
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Disconnecting.is_connected());
    }

    #[test]
    fn inbound_json_is_sniffed() {
        let message = inbound_text(r#"{"type":"pong"}"#);
        assert_eq!(message.kind, MessageType::Json);
        assert_eq!(message.payload, Payload::Json(json!({"type": "pong"})));

        assert_eq!(inbound_text("pong").kind, MessageType::Text);
        assert_eq!(inbound_text("42").kind, MessageType::Text);
        assert_eq!(inbound_text("{not json").kind, MessageType::Text);
    }

    #[test]
    fn outbound_json_is_text_frame() {
        let frame = outbound_frame(&Payload::Json(json!({"a": 1}))).unwrap();
        assert_eq!(frame, Frame::text(r#"{"a":1}"#));

        let frame = outbound_frame(&Payload::Binary(vec![1, 2])).unwrap();
        assert!(frame.is_binary());
    }

    #[test]
    fn request_carries_headers_and_protocols() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("x-api-key".to_owned(), "secret".to_owned());
        let config = Config::builder()
            .url("ws://127.0.0.1:9001/socket")
            .protocols(vec!["chat".to_owned(), "v2".to_owned()])
            .headers(headers)
            .build();
        let transport = WebSocketTransport::new(config);

        let request = transport.request().unwrap();

        assert_eq!(request.headers()["x-api-key"], "secret");
        assert_eq!(request.headers()[SEC_WEBSOCKET_PROTOCOL], "chat, v2");
    }

    #[test]
    fn invalid_url_is_rejected() {
        let transport = WebSocketTransport::new(Config::builder().url("not a url").build());
        assert!(transport.request().is_err());
    }

    #[tokio::test]
    async fn send_while_disconnected_fails() {
        let transport = WebSocketTransport::new(Config::builder().url("ws://127.0.0.1:9").build());

        let err = transport.send(Payload::from("hello")).await.unwrap_err();

        assert_eq!(err.kind(), crate::error::Kind::State);
    }
}

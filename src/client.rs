//! The resilient client: one transport, one heartbeat, one reconnection policy, one interceptor
//! chain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_stream::try_stream;
use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::error::Error;
use crate::types::{Message, Payload};
use crate::ws::config::Config;
use crate::ws::connection::{ConnectionState, WebSocketTransport};
use crate::ws::error::WsError;
use crate::ws::events::{EventSink, Logger};
use crate::ws::heartbeat::HeartbeatManager;
use crate::ws::interceptor::{Interceptor, InterceptorChain};
use crate::ws::reconnect::ReconnectionManager;
use crate::ws::stats::{ConfigSummary, ConnectionStats};
use crate::ws::traits::Transport;

/// Settle time between the disconnect and the connect of [`Client::force_reconnect`].
const FORCE_RECONNECT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// WebSocket client with heartbeat liveness detection, automatic reconnection and interceptors.
///
/// Cloning is cheap and yields another handle to the same connection. Construction spawns the
/// background tasks that follow the transport, so it must happen inside a tokio runtime.
///
/// # Examples
///
/// ```rust, no_run
/// use adapter_websocket::client::Client;
/// use adapter_websocket::ws::config::Config;
/// use futures::StreamExt as _;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::new(Config::builder().url("wss://echo.example.com").build());
///     client.connect().await?;
///     client.send_text("hello").await?;
///
///     let mut messages = Box::pin(client.message_stream());
///     if let Some(message) = messages.next().await {
///         println!("{}", message?.payload);
///     }
///
///     client.dispose().await;
///     Ok(())
/// }
/// ```
pub struct Client<T: Transport = WebSocketTransport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ClientInner<T: Transport> {
    transport: T,
    heartbeat: HeartbeatManager,
    reconnection: ReconnectionManager,
    interceptors: InterceptorChain,
    logger: Logger,
    logs: Arc<EventSink<String>>,
    messages: EventSink<Message>,
    errors: EventSink<Error>,
    stats: EventSink<ConnectionStats>,
    disposed: AtomicBool,
    /// Set by [`Client::disconnect`] so the resulting state change does not trigger reconnection.
    manual_disconnect: AtomicBool,
    /// Cancels the transport-following tasks
    token: CancellationToken,
}

impl Client<WebSocketTransport> {
    /// Create a client backed by a real WebSocket connection. Nothing is connected yet.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_transport_factory(config, WebSocketTransport::with_logger)
    }
}

impl<T: Transport> Client<T> {
    /// Create a client around a transport built by `make`, which receives the configuration and
    /// a logger that writes to this client's log stream.
    pub fn with_transport_factory<F>(config: Config, make: F) -> Self
    where
        F: FnOnce(Config, Logger) -> T,
    {
        let logs = Arc::new(EventSink::default());
        let logger = Logger::new("Transport", config.enable_logging, Arc::clone(&logs));
        Self::assemble(make(config, logger), logs)
    }

    /// Create a client around an existing transport. Transport logs only reach `tracing`.
    pub fn with_transport(transport: T) -> Self {
        Self::assemble(transport, Arc::new(EventSink::default()))
    }

    fn assemble(transport: T, logs: Arc<EventSink<String>>) -> Self {
        let config = transport.config().clone();
        let logger = Logger::new("Client", config.enable_logging, Arc::clone(&logs));

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner<T>>| {
            let probe_client = weak.clone();
            let heartbeat = HeartbeatManager::new(
                config.heartbeat.clone(),
                logger.named("Heartbeat"),
                move |probe: String| {
                    let client = probe_client.clone();
                    async move {
                        let inner = client.upgrade().ok_or_else(Error::disposed)?;
                        inner.send_message(Message::heartbeat(probe)).await
                    }
                },
            );

            let reconnect_client = weak.clone();
            let reconnection = ReconnectionManager::new(
                config.reconnect.clone(),
                logger.named("Reconnection"),
                move || {
                    let client = reconnect_client.clone();
                    async move {
                        let inner = client.upgrade().ok_or_else(Error::disposed)?;
                        inner.transport.connect().await
                    }
                },
            );

            ClientInner {
                transport,
                heartbeat,
                reconnection,
                interceptors: InterceptorChain::new(logger.named("Interceptors")),
                logger,
                logs,
                messages: EventSink::default(),
                errors: EventSink::default(),
                stats: EventSink::default(),
                disposed: AtomicBool::new(false),
                manual_disconnect: AtomicBool::new(false),
                token: CancellationToken::new(),
            }
        });

        inner.wire_callbacks();
        inner.follow_transport();

        Self { inner }
    }

    /// Open the connection.
    ///
    /// On success the reconnection state is reset and heartbeats start. On failure reconnection
    /// is scheduled (when enabled) and the error is returned; it is also delivered on the error
    /// stream through the transport.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.is_disposed() {
            return Err(Error::disposed());
        }

        inner.manual_disconnect.store(false, Ordering::SeqCst);
        inner
            .logger
            .info(format_args!("Connecting to {}", inner.transport.config().url));

        match inner.transport.connect().await {
            Ok(()) => {
                inner.reconnection.reset();
                inner.heartbeat.start();
                inner.publish_stats();
                Ok(())
            }
            Err(e) => {
                inner.logger.error(format_args!("Connection failed: {e}"));
                if !inner.is_disposed() {
                    inner.reconnection.start_reconnection();
                }
                inner.publish_stats();
                Err(e)
            }
        }
    }

    /// Send `message` through the interceptors and the transport.
    ///
    /// Fails with a [`crate::error::Kind::State`] error when not connected. A cancelling or
    /// failing interceptor drops the message and returns `Ok(())`; interceptor failures are
    /// reported on the error stream.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.inner.send_message(message).await
    }

    pub async fn send(&self, payload: Payload) -> Result<()> {
        self.send_message(Message::new(payload)).await
    }

    pub async fn send_text<S: Into<String>>(&self, text: S) -> Result<()> {
        self.send_message(Message::text(text)).await
    }

    /// Serialize `value` and send it as a JSON message.
    pub async fn send_json<V: Serialize + ?Sized>(&self, value: &V) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.send_message(Message::json(value)).await
    }

    pub async fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.send_message(Message::binary(bytes)).await
    }

    /// Close the connection. Automatic reconnection stays off until the next [`Client::connect`].
    pub async fn disconnect(&self, code: Option<u16>, reason: Option<String>) -> Result<()> {
        let inner = &self.inner;
        inner.manual_disconnect.store(true, Ordering::SeqCst);
        inner.heartbeat.stop();
        inner.reconnection.stop_reconnection();

        let result = inner.transport.disconnect(code, reason).await;
        if let Err(e) = &result {
            inner.route_error(e.clone()).await;
        }
        inner.publish_stats();

        result
    }

    /// Disconnect, wait briefly, and connect again.
    pub async fn force_reconnect(&self) -> Result<()> {
        self.inner.logger.info("Forcing reconnection");
        self.disconnect(None, Some("Force reconnect".to_owned()))
            .await?;
        tokio::time::sleep(FORCE_RECONNECT_SETTLE_DELAY).await;
        self.connect().await
    }

    /// Tear everything down. Idempotent; afterwards [`Client::connect`] fails and all streams end.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        inner.logger.info("Disposing client");
        inner.heartbeat.dispose();
        inner.reconnection.dispose();
        inner.token.cancel();
        inner.transport.dispose().await;

        inner.messages.close();
        inner.errors.close();
        inner.stats.close();
        inner.logs.close();
    }

    /// Register an interceptor after all previously registered ones.
    pub fn add_interceptor<I: Interceptor>(&self, interceptor: I) {
        self.inner.interceptors.add(Arc::new(interceptor));
    }

    pub fn clear_interceptors(&self) {
        self.inner.interceptors.clear();
    }

    #[must_use]
    pub fn connection_stats(&self) -> ConnectionStats {
        self.inner.connection_stats()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    /// Receiver observing connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.state_receiver()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        self.inner.transport.config()
    }

    /// The underlying transport, e.g. to drive an [`crate::ws::memory::InMemoryTransport`].
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Messages that passed every interceptor.
    #[must_use]
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.inner.messages.subscribe()
    }

    /// Stream of incoming messages. Ends when the client is disposed.
    ///
    /// A slow consumer that falls behind gets a single [`WsError::Lagged`] item and then resumes
    /// with the oldest message still buffered.
    pub fn message_stream(&self) -> impl Stream<Item = Result<Message>> + use<T> {
        let mut rx = self.inner.messages.subscribe();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(message) => yield message,
                    Err(RecvError::Lagged(count)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Message stream lagged, missed {count} messages");
                        Err(WsError::Lagged { count })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    #[must_use]
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Error> {
        self.inner.errors.subscribe()
    }

    /// Snapshots published after every state change and manager callback.
    #[must_use]
    pub fn subscribe_stats(&self) -> broadcast::Receiver<ConnectionStats> {
        self.inner.stats.subscribe()
    }

    /// Timestamped log lines from every component, when logging is enabled.
    #[must_use]
    pub fn subscribe_logs(&self) -> broadcast::Receiver<String> {
        self.inner.logs.subscribe()
    }
}

impl<T: Transport> ClientInner<T> {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn connection_stats(&self) -> ConnectionStats {
        let state = self.transport.state();
        ConnectionStats {
            connection_state: state.to_string(),
            is_connected: state.is_connected(),
            heartbeat: self.heartbeat.stats(),
            reconnection: self.reconnection.stats(),
            config: ConfigSummary::from(self.transport.config()),
        }
    }

    fn publish_stats(&self) {
        self.stats.emit(self.connection_stats());
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::disposed());
        }
        if !self.transport.is_connected() {
            return Err(Error::not_connected());
        }

        let message = match self.interceptors.process_send(message).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.logger
                    .error(format_args!("Interceptor rejected outgoing message: {e}"));
                self.route_error(e).await;
                return Ok(());
            }
        };

        if let Err(e) = self.transport.send_message(message).await {
            self.logger.error(format_args!("Send failed: {e}"));
            self.route_error(e.clone()).await;
            return Err(e);
        }

        Ok(())
    }

    /// Deliver `error` to the interceptors and the error stream.
    async fn route_error(&self, error: Error) {
        self.interceptors.notify_error(&error).await;
        self.errors.emit(error);
        self.publish_stats();
    }

    fn on_state(&self, state: ConnectionState) {
        self.logger
            .info(format_args!("Connection state changed to {state}"));

        match state {
            ConnectionState::Connected => self.heartbeat.start(),
            ConnectionState::Disconnected => {
                self.heartbeat.stop();
                if !self.is_disposed() && !self.manual_disconnect.load(Ordering::SeqCst) {
                    self.reconnection.start_reconnection();
                }
            }
            ConnectionState::Error => self.heartbeat.stop(),
            _ => {}
        }

        self.publish_stats();
    }

    async fn on_message(&self, message: Message) {
        match self.interceptors.process_receive(message).await {
            Ok(Some(message)) => {
                self.heartbeat.handle_incoming_message(&message);
                self.messages.emit(message);
            }
            Ok(None) => {}
            Err(e) => {
                self.logger
                    .error(format_args!("Interceptor rejected incoming message: {e}"));
                self.route_error(e).await;
            }
        }
    }

    async fn on_transport_error(&self, error: Error) {
        self.logger.error(format_args!("Transport error: {error}"));
        self.route_error(error).await;
    }

    fn on_heartbeat_timeout(&self) {
        self.logger
            .warn("Heartbeat timeout, treating connection as dead");
        self.heartbeat.stop();
        if !self.is_disposed() {
            self.reconnection.start_reconnection();
        }
        self.publish_stats();
    }
}

impl<T: Transport> ClientInner<T> {
    /// Republish stats on every manager callback and react to heartbeat exhaustion.
    fn wire_callbacks(self: &Arc<Self>) {
        let client = Arc::downgrade(self);
        let stats_on = move || {
            let client = client.clone();
            move || {
                if let Some(inner) = client.upgrade() {
                    inner.publish_stats();
                }
            }
        };

        self.heartbeat.on_connection_healthy(stats_on());
        self.heartbeat.on_connection_unhealthy(stats_on());

        let client = Arc::downgrade(self);
        self.heartbeat.on_heartbeat_timeout(move || {
            if let Some(inner) = client.upgrade() {
                inner.on_heartbeat_timeout();
            }
        });

        let attempt_stats = stats_on();
        self.reconnection
            .on_reconnect_attempt(move |_attempt| attempt_stats());
        self.reconnection.on_reconnect_success(stats_on());
        let failure_stats = stats_on();
        self.reconnection
            .on_reconnect_failure(move |_attempt, _error| failure_stats());

        let client = Arc::downgrade(self);
        self.reconnection.on_max_attempts_reached(move |attempts| {
            if let Some(inner) = client.upgrade() {
                inner.logger.error(format_args!(
                    "Giving up after {attempts} reconnection attempts"
                ));
                inner.publish_stats();
            }
        });
    }

    /// Spawn the tasks that follow the transport's state, message and error streams.
    ///
    /// Tasks hold a weak handle, so they end with the client even without [`Client::dispose`].
    fn follow_transport(self: &Arc<Self>) {
        let mut states = self.transport.state_receiver();
        let client = Arc::downgrade(self);
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *states.borrow_and_update();
                        let Some(inner) = client.upgrade() else {
                            break;
                        };
                        inner.on_state(state);
                    }
                }
            }
        });

        let mut messages = self.transport.subscribe_messages();
        let client = Arc::downgrade(self);
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    received = messages.recv() => match received {
                        Ok(message) => {
                            let Some(inner) = client.upgrade() else {
                                break;
                            };
                            inner.on_message(message).await;
                        }
                        Err(RecvError::Lagged(count)) => {
                            if let Some(inner) = client.upgrade() {
                                inner.logger.warn(format_args!(
                                    "Transport message stream lagged, missed {count} messages"
                                ));
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        let mut errors = self.transport.subscribe_errors();
        let client = Arc::downgrade(self);
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    received = errors.recv() => match received {
                        Ok(error) => {
                            let Some(inner) = client.upgrade() else {
                                break;
                            };
                            inner.on_transport_error(error).await;
                        }
                        Err(RecvError::Lagged(count)) => {
                            if let Some(inner) = client.upgrade() {
                                inner.logger.warn(format_args!(
                                    "Transport error stream lagged, missed {count} errors"
                                ));
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

impl<T: Transport> Drop for ClientInner<T> {
    fn drop(&mut self) {
        self.token.cancel();
        self.heartbeat.dispose();
        self.reconnection.dispose();
    }
}

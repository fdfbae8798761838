//! A script-driven [`Transport`] that never touches the network.
//!
//! [`InMemoryTransport`] behaves like a connected socket whose far end is the test: outbound
//! messages are recorded, inbound traffic, errors and drops are injected on demand, and connect or
//! send failures can be forced with a switch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng as _;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::config::Config;
use super::connection::{ConnectionState, publish_state};
use super::error::WsError;
use super::events::{EventSink, Logger};
use super::traits::Transport;
use crate::Result;
use crate::error::Error;
use crate::types::Message;

#[derive(Debug, Default)]
struct Script {
    delay: Duration,
    fail_connect: bool,
    fail_send: bool,
    auto_reply: bool,
    sent: Vec<Message>,
    instability: Option<JoinHandle<()>>,
}

struct Shared {
    logger: Logger,
    state_tx: watch::Sender<ConnectionState>,
    messages: EventSink<Message>,
    errors: EventSink<Error>,
    script: Mutex<Script>,
}

impl Shared {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        if publish_state(&self.state_tx, state) {
            self.logger.debug(format_args!("State changed to {state}"));
        }
    }

    fn drop_connection(&self, reason: &str) {
        if !self.state_tx.borrow().is_connected() {
            return;
        }

        self.logger
            .warn(format_args!("Connection dropped: {reason}"));
        self.errors.emit(WsError::ConnectionClosed.into());
        self.set_state(ConnectionState::Disconnected);
    }
}

/// In-memory [`Transport`] for deterministic tests.
///
/// State changes are published exactly like the production transport, so a
/// [`crate::client::Client`] built on top of it runs its full heartbeat and reconnection logic.
pub struct InMemoryTransport {
    config: Config,
    shared: Arc<Shared>,
    disposed: AtomicBool,
}

impl InMemoryTransport {
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
                script: Mutex::new(Script::default()),
            }),
            disposed: AtomicBool::new(false),
        }
    }

    /// Artificial latency applied to every connect and send.
    pub fn set_delay(&self, delay: Duration) {
        self.shared.script().delay = delay;
    }

    /// Make every subsequent [`Transport::connect`] fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.shared.script().fail_connect = fail;
    }

    /// Make every subsequent send fail.
    pub fn set_fail_send(&self, fail: bool) {
        self.shared.script().fail_send = fail;
    }

    /// Answer each sent heartbeat probe with the configured expected reply (or `"pong"`).
    pub fn set_auto_reply(&self, enabled: bool) {
        self.shared.script().auto_reply = enabled;
    }

    /// Deliver `message` as if it had arrived from the server.
    pub fn simulate_message(&self, message: Message) {
        self.shared.messages.emit(message);
    }

    /// Publish `error` on the error stream without changing the state.
    pub fn simulate_error(&self, error: Error) {
        self.shared.errors.emit(error);
    }

    /// Drop the connection as if the server went away.
    pub fn simulate_disconnect(&self) {
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Force an arbitrary state, e.g. [`ConnectionState::Error`].
    pub fn simulate_state(&self, state: ConnectionState) {
        self.shared.set_state(state);
    }

    /// Every message that reached the wire, oldest first.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<Message> {
        self.shared.script().sent.clone()
    }

    pub fn clear_sent_messages(&self) {
        self.shared.script().sent.clear();
    }

    /// Every `period`, drop a live connection with the given probability.
    ///
    /// Replaces any running simulation. Must be called within a tokio runtime.
    pub fn start_instability(&self, period: Duration, probability: f64) {
        let probability = probability.clamp(0.0, 1.0);
        let shared = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                sleep(period).await;
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if rand::rng().random_bool(probability) {
                    shared.drop_connection("simulated network instability");
                }
            }
        });

        if let Some(previous) = self.shared.script().instability.replace(task) {
            previous.abort();
        }
        self.shared.logger.info(format_args!(
            "Instability simulation started (every {period:?}, p={probability})"
        ));
    }

    pub fn stop_instability(&self) {
        if let Some(task) = self.shared.script().instability.take() {
            task.abort();
            self.shared.logger.info("Instability simulation stopped");
        }
    }

    async fn pause(&self) {
        let delay = self.shared.script().delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
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

        self.shared.set_state(ConnectionState::Connecting);
        self.pause().await;

        if self.shared.script().fail_connect {
            let error: Error = WsError::ConnectFailed("simulated connection failure".to_owned()).into();
            self.shared
                .logger
                .error(format_args!("Connection failed: {error}"));
            self.shared.set_state(ConnectionState::Error);
            self.shared.errors.emit(error.clone());
            return Err(error);
        }

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

        self.pause().await;

        let auto_reply = {
            let mut script = self.shared.script();
            if script.fail_send {
                return Err(WsError::SendFailed("simulated send failure".to_owned()).into());
            }
            script.sent.push(message.clone());
            script.auto_reply
        };

        if auto_reply && message.payload.as_text() == Some(self.config.heartbeat.message.as_str()) {
            let reply = self
                .config
                .heartbeat
                .expected_pong
                .clone()
                .unwrap_or_else(|| "pong".to_owned());
            self.shared.messages.emit(Message::heartbeat(reply));
        }

        Ok(())
    }

    async fn disconnect(&self, code: Option<u16>, reason: Option<String>) -> Result<()> {
        if matches!(self.state(), ConnectionState::Disconnected) {
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Disconnecting);
        self.shared.logger.info(format_args!(
            "Disconnecting (code {}, reason {:?})",
            code.unwrap_or(1000),
            reason.unwrap_or_default()
        ));
        self.shared.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop_instability();
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.messages.close();
        self.shared.errors.close();
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        self.stop_instability();
    }
}

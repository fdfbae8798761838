#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use adapter_websocket::Client;
use adapter_websocket::error::Error;
use adapter_websocket::types::{Message, Payload};
use adapter_websocket::ws::InMemoryTransport;
use adapter_websocket::ws::config::{Config, HeartbeatConfig, ReconnectConfig};
use adapter_websocket::ws::interceptor::FnInterceptor;

pub const MEMORY_URL: &str = "ws://memory.test/socket";

pub type MemoryClient = Client<InMemoryTransport>;

/// Heartbeat fast enough for paused-clock tests: probe every 100ms, wait 50ms, two misses.
#[must_use]
pub fn fast_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        interval: Duration::from_millis(100),
        timeout: Duration::from_millis(50),
        max_missed: 2,
        ..HeartbeatConfig::default()
    }
}

#[must_use]
pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        ..ReconnectConfig::default()
    }
}

#[must_use]
pub fn config() -> Config {
    Config::builder().url(MEMORY_URL).build()
}

#[must_use]
pub fn memory_client(config: Config) -> MemoryClient {
    Client::with_transport_factory(config, InMemoryTransport::with_logger)
}

/// Let the client's background tasks drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Appends `tag` to text payloads in both directions.
#[must_use]
pub fn suffix(tag: &'static str) -> FnInterceptor {
    let append = move |message: Message| {
        let text = format!("{}{tag}", message.payload);
        Ok(Some(message.with_payload(Payload::Text(text))))
    };

    FnInterceptor::new().on_send(append).on_receive(append)
}

/// Records every error it is notified of.
#[must_use]
pub fn error_recorder() -> (FnInterceptor, Arc<Mutex<Vec<Error>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let interceptor = FnInterceptor::new().on_error(move |error: &Error| {
        sink.lock().unwrap().push(error.clone());
    });

    (interceptor, seen)
}

/// Texts of every message the transport put on the wire.
#[must_use]
pub fn sent_texts(client: &MemoryClient) -> Vec<String> {
    client
        .transport()
        .sent_messages()
        .iter()
        .map(|message| message.payload.to_string())
        .collect()
}

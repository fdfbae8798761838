#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adapter_websocket::Client;
use adapter_websocket::error::Kind;
use adapter_websocket::types::{MessageType, Payload};
use adapter_websocket::ws::ConnectionState;
use adapter_websocket::ws::config::{Config, HeartbeatConfig, ReconnectConfig};
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;

/// Commands the test can push to every connected client.
#[derive(Debug, Clone)]
enum Outbound {
    Text(String),
    Close,
}

/// Mock WebSocket server.
struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast frames to ALL connected clients
    outbound_tx: broadcast::Sender<Outbound>,
    /// Text frames received from clients
    received_rx: mpsc::UnboundedReceiver<String>,
    /// Handshake headers of the most recent connection
    headers: Arc<Mutex<HashMap<String, String>>>,
    /// Number of accepted connections
    connections: watch::Receiver<usize>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port. Text `ping` frames are answered with `pong`.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (outbound_tx, _) = broadcast::channel::<Outbound>(100);
        let (received_tx, received_rx) = mpsc::unbounded_channel::<String>();
        let (connections_tx, connections) = watch::channel(0_usize);
        let headers = Arc::new(Mutex::new(HashMap::new()));

        let broadcast_tx = outbound_tx.clone();
        let captured = Arc::clone(&headers);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let captured = Arc::clone(&captured);
                let callback = move |request: &Request, mut response: Response| {
                    let mut seen = captured.lock().unwrap();
                    seen.clear();
                    for (name, value) in request.headers() {
                        seen.insert(
                            name.as_str().to_owned(),
                            value.to_str().unwrap_or_default().to_owned(),
                        );
                    }

                    // Accept the first offered sub-protocol
                    if let Some(offered) = request.headers().get("sec-websocket-protocol") {
                        let first = offered
                            .to_str()
                            .unwrap_or_default()
                            .split(',')
                            .next()
                            .unwrap_or_default()
                            .trim()
                            .to_owned();
                        response.headers_mut().insert(
                            "sec-websocket-protocol",
                            HeaderValue::from_str(&first).unwrap(),
                        );
                    }
                    Ok(response)
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };
                connections_tx.send_modify(|count| *count += 1);

                let (mut write, mut read) = ws_stream.split();
                let received_tx = received_tx.clone();
                let mut outbound_rx = broadcast_tx.subscribe();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            frame = read.next() => {
                                match frame {
                                    Some(Ok(Message::Text(text))) if text.as_str() == "ping" => {
                                        if write.send(Message::text("pong")).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some(Ok(Message::Text(text))) => {
                                        drop(received_tx.send(text.to_string()));
                                    }
                                    Some(Ok(Message::Binary(bytes))) => {
                                        drop(received_tx.send(format!("binary:{}", bytes.len())));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            command = outbound_rx.recv() => {
                                match command {
                                    Ok(Outbound::Text(text)) => {
                                        if write.send(Message::text(text)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(Outbound::Close) | Err(_) => {
                                        drop(write.send(Message::Close(None)).await);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            outbound_tx,
            received_rx,
            headers,
            connections,
        }
    }

    fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Send a text frame to all connected clients.
    fn send(&self, text: &str) {
        drop(self.outbound_tx.send(Outbound::Text(text.to_owned())));
    }

    /// Close every open connection from the server side.
    fn close_all(&self) {
        drop(self.outbound_tx.send(Outbound::Close));
    }

    /// Receive the next text frame sent by a client.
    async fn recv(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.received_rx.recv())
            .await
            .ok()
            .flatten()
    }

    async fn wait_for_connections(&mut self, count: usize) {
        timeout(
            Duration::from_secs(5),
            self.connections.wait_for(|current| *current >= count),
        )
        .await
        .unwrap()
        .unwrap();
    }
}

fn quiet_config(url: String) -> Config {
    Config::builder()
        .url(url)
        .heartbeat(HeartbeatConfig::disabled())
        .reconnect(ReconnectConfig::disabled())
        .build()
}

async fn wait_for_state(client: &Client, state: ConnectionState) {
    let mut states = client.state_receiver();
    timeout(Duration::from_secs(5), states.wait_for(|current| *current == state))
        .await
        .unwrap()
        .unwrap();
}

mod connection {
    use super::*;

    #[tokio::test]
    async fn send_and_receive() {
        let mut server = MockWsServer::start().await;
        let client = Client::new(quiet_config(server.ws_url("/ws")));
        let mut messages = Box::pin(client.message_stream());

        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        client.send_text("hello").await.unwrap();
        client
            .send_json(&json!({"type": "subscribe", "channel": "ticker"}))
            .await
            .unwrap();
        client.send_binary(vec![1, 2, 3]).await.unwrap();

        assert_eq!(server.recv().await.unwrap(), "hello");
        let subscribe: serde_json::Value =
            serde_json::from_str(&server.recv().await.unwrap()).unwrap();
        assert_eq!(subscribe["channel"], "ticker");
        assert_eq!(server.recv().await.unwrap(), "binary:3");

        server.send(r#"{"price": 42}"#);
        server.send("plain text");

        let first = timeout(Duration::from_secs(2), messages.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.kind, MessageType::Json);
        assert_eq!(first.payload, Payload::Json(json!({"price": 42})));

        let second = timeout(Duration::from_secs(2), messages.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.payload, Payload::from("plain text"));

        client.dispose().await;
    }

    #[tokio::test]
    async fn handshake_carries_headers_and_protocols() {
        let mut server = MockWsServer::start().await;
        let mut headers = HashMap::new();
        headers.insert("x-client-id".to_owned(), "abc-123".to_owned());
        let config = Config::builder()
            .url(server.ws_url("/ws"))
            .headers(headers)
            .protocols(vec!["v2.json".to_owned(), "v1.json".to_owned()])
            .heartbeat(HeartbeatConfig::disabled())
            .reconnect(ReconnectConfig::disabled())
            .build();
        let client = Client::new(config);

        client.connect().await.unwrap();
        server.wait_for_connections(1).await;

        let seen = server.headers.lock().unwrap().clone();
        assert_eq!(seen["x-client-id"], "abc-123");
        assert_eq!(seen["sec-websocket-protocol"], "v2.json, v1.json");

        client.dispose().await;
    }

    #[tokio::test]
    async fn refused_connection_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::new(quiet_config(format!("ws://{addr}")));
        let mut errors = client.subscribe_errors();

        let err = client.connect().await.unwrap_err();

        assert_eq!(err.kind(), Kind::WebSocket);
        assert_eq!(client.state(), ConnectionState::Error);
        let reported = timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reported.kind(), Kind::WebSocket);
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept TCP but never answer the upgrade request
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = Config::builder()
            .url(format!("ws://{addr}"))
            .connection_timeout(Duration::from_millis(200))
            .heartbeat(HeartbeatConfig::disabled())
            .reconnect(ReconnectConfig::disabled())
            .build();
        let client = Client::new(config);

        let err = client.connect().await.unwrap_err();

        assert_eq!(err.kind(), Kind::Timeout);
    }

    #[tokio::test]
    async fn disconnect_closes_cleanly() {
        let server = MockWsServer::start().await;
        let client = Client::new(quiet_config(server.ws_url("/ws")));
        client.connect().await.unwrap();

        client
            .disconnect(Some(1000), Some("done".to_owned()))
            .await
            .unwrap();

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(
            client.send_text("late").await.unwrap_err().kind(),
            Kind::State
        );
    }
}

mod resilience {
    use super::*;

    #[tokio::test]
    async fn server_close_triggers_reconnect() {
        let mut server = MockWsServer::start().await;
        let config = Config::builder()
            .url(server.ws_url("/ws"))
            .heartbeat(HeartbeatConfig::disabled())
            .reconnect(ReconnectConfig {
                initial_backoff: Duration::from_millis(50),
                ..ReconnectConfig::default()
            })
            .build();
        let client = Client::new(config);
        client.connect().await.unwrap();
        server.wait_for_connections(1).await;

        server.close_all();
        wait_for_state(&client, ConnectionState::Disconnected).await;
        server.wait_for_connections(2).await;
        wait_for_state(&client, ConnectionState::Connected).await;

        client.send_text("after reconnect").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), "after reconnect");

        client.dispose().await;
    }

    #[tokio::test]
    async fn heartbeat_round_trip() {
        let server = MockWsServer::start().await;
        let config = Config::builder()
            .url(server.ws_url("/ws"))
            .heartbeat(HeartbeatConfig {
                interval: Duration::from_millis(50),
                timeout: Duration::from_millis(500),
                ..HeartbeatConfig::default()
            })
            .reconnect(ReconnectConfig::disabled())
            .build();
        let client = Client::new(config);
        client.connect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        let stats = client.connection_stats();
        assert!(stats.heartbeat.is_active);
        assert_eq!(stats.heartbeat.missed_heartbeats, 0);
        assert!(stats.heartbeat.last_pong_received.is_some());

        client.dispose().await;
    }
}

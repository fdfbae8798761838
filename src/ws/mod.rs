//! Core WebSocket infrastructure.
//!
//! The building blocks [`crate::client::Client`] is assembled from. Each piece can also be used on
//! its own, e.g. a [`HeartbeatManager`] driving a hand-written socket loop.
//!
//! # Architecture
//!
//! - [`Transport`]: the connection seam, implemented by [`WebSocketTransport`] (tungstenite) and
//!   [`InMemoryTransport`] (scripted, for tests)
//! - [`HeartbeatManager`]: probe/reply liveness detection with a missed-probe budget
//! - [`ReconnectionManager`]: exponential backoff with jitter and an attempt budget
//! - [`InterceptorChain`]: ordered transform/cancel hooks for outgoing and incoming messages
//! - [`EventSink`]: closable broadcast point behind every client stream

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod interceptor;
pub mod memory;
pub mod reconnect;
pub mod stats;
pub(crate) mod timer;
pub mod tls;
pub mod traits;

pub use connection::{ConnectionState, WebSocketTransport};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use events::EventSink;
pub use heartbeat::HeartbeatManager;
pub use interceptor::{FnInterceptor, Interceptor, InterceptorChain};
pub use memory::InMemoryTransport;
pub use reconnect::ReconnectionManager;
pub use traits::Transport;

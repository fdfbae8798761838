#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::collections::HashMap;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;

use super::tls::BadCertificateCallback;

const DEFAULT_CONNECTION_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_MESSAGE: &str = "ping";
const DEFAULT_EXPECTED_PONG: &str = "pong";
const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Symmetric jitter applied to every exponential backoff delay (±25%).
pub const JITTER_FACTOR: f64 = 0.25;

/// Configuration for WebSocket client behavior.
///
/// Built once and never mutated by the client. Use [`Config::with_heartbeat`],
/// [`Config::with_reconnect`] and friends to derive a modified copy.
///
/// ```
/// use std::time::Duration;
///
/// use adapter_websocket::ws::config::{Config, HeartbeatConfig};
///
/// let config = Config::builder()
///     .url("wss://echo.example.com/socket")
///     .connection_timeout(Duration::from_secs(5))
///     .build();
///
/// let quiet = config.with_heartbeat(HeartbeatConfig::disabled());
/// assert!(!quiet.heartbeat.enabled);
/// assert!(config.heartbeat.enabled);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Target `ws://` or `wss://` URL
    #[builder(into)]
    pub url: String,
    /// Sub-protocols offered in the `Sec-WebSocket-Protocol` header
    #[builder(default)]
    pub protocols: Vec<String>,
    /// Extra headers sent with the opening handshake
    #[builder(default)]
    pub headers: HashMap<String, String>,
    /// Maximum time allowed for the opening handshake
    #[builder(default = DEFAULT_CONNECTION_TIMEOUT_DURATION)]
    pub connection_timeout: Duration,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Liveness probing configuration
    #[builder(default)]
    pub heartbeat: HeartbeatConfig,
    /// Whether components emit log lines
    #[builder(default = true)]
    pub enable_logging: bool,
    /// Invoked when the server certificate fails validation; returning `true` accepts it
    pub on_bad_certificate: Option<BadCertificateCallback>,
}

impl Config {
    /// Returns a copy of this configuration targeting a different URL.
    #[must_use]
    pub fn with_url<S: Into<String>>(&self, url: S) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }

    /// Returns a copy of this configuration with a different heartbeat policy.
    #[must_use]
    pub fn with_heartbeat(&self, heartbeat: HeartbeatConfig) -> Self {
        Self {
            heartbeat,
            ..self.clone()
        }
    }

    /// Returns a copy of this configuration with a different reconnection policy.
    #[must_use]
    pub fn with_reconnect(&self, reconnect: ReconnectConfig) -> Self {
        Self {
            reconnect,
            ..self.clone()
        }
    }

    /// Returns a copy of this configuration with logging switched on or off.
    #[must_use]
    pub fn with_logging(&self, enable_logging: bool) -> Self {
        Self {
            enable_logging,
            ..self.clone()
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[expect(
    clippy::exhaustive_structs,
    reason = "Policies are plain data meant for struct update syntax"
)]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Whether the client reconnects on its own after losing the connection
    pub enabled: bool,
    /// Maximum number of reconnection attempts before giving up
    pub max_attempts: u32,
    /// Backoff duration for the first reconnection attempt
    pub initial_backoff: Duration,
    /// Grow the delay between attempts; when `false` every attempt waits `initial_backoff`
    pub exponential: bool,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            exponential: true,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
        }
    }
}

impl ReconnectConfig {
    /// A policy that never reconnects automatically.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_randomization_factor(JITTER_FACTOR)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

/// Configuration for heartbeat (ping/pong) liveness detection.
#[expect(
    clippy::exhaustive_structs,
    reason = "Policies are plain data meant for struct update syntax"
)]
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Whether probes are sent at all
    pub enabled: bool,
    /// Interval between probes
    pub interval: Duration,
    /// Maximum time to wait for the expected reply to a probe
    pub timeout: Duration,
    /// Probe payload
    pub message: String,
    /// Reply that answers a probe. `None` means any reply counts and no reply timeout is armed.
    pub expected_pong: Option<String>,
    /// Consecutive missed probes after which the connection is declared dead
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            message: DEFAULT_HEARTBEAT_MESSAGE.to_owned(),
            expected_pong: Some(DEFAULT_EXPECTED_PONG.to_owned()),
            max_missed: DEFAULT_MAX_MISSED_HEARTBEATS,
        }
    }
}

impl HeartbeatConfig {
    /// A policy that never probes.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

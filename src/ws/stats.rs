//! Point-in-time statistics snapshots.
//!
//! Serialized field names follow the camelCase layout applications consume, e.g.
//!
//! ```json
//! {
//!   "connectionState": "Connected",
//!   "isConnected": true,
//!   "heartbeat": { "isActive": true, "missedHeartbeats": 0, "...": "..." },
//!   "reconnection": { "isReconnecting": false, "nextAttemptIn": "not scheduled", "...": "..." },
//!   "config": { "url": "wss://...", "autoReconnect": true, "...": "..." }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::Config;

/// Snapshot of the Heartbeat Manager.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStats {
    pub is_active: bool,
    pub missed_heartbeats: u32,
    pub waiting_for_pong: bool,
    pub last_heartbeat_sent: Option<DateTime<Utc>>,
    pub last_pong_received: Option<DateTime<Utc>>,
    /// Configured interval in seconds
    pub heartbeat_interval: f64,
    pub max_missed_heartbeats: u32,
}

/// Where the next reconnection attempt stands.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
pub enum NextAttempt {
    #[serde(rename = "scheduled")]
    #[strum(serialize = "scheduled")]
    Scheduled,
    /// The attempt's reconnect action is running
    #[serde(rename = "in progress")]
    #[strum(serialize = "in progress")]
    InProgress,
    #[serde(rename = "not scheduled")]
    #[strum(serialize = "not scheduled")]
    NotScheduled,
}

/// Snapshot of the Reconnection Manager.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionStats {
    pub is_reconnecting: bool,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    /// Most recently computed delay in seconds
    pub current_delay: f64,
    pub next_attempt_in: NextAttempt,
}

/// The configuration fields surfaced in [`ConnectionStats`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub url: String,
    pub auto_reconnect: bool,
    pub enable_heartbeat: bool,
    /// Heartbeat interval in seconds
    pub heartbeat_interval: f64,
    pub max_reconnect_attempts: u32,
}

impl From<&Config> for ConfigSummary {
    fn from(config: &Config) -> Self {
        Self {
            url: config.url.clone(),
            auto_reconnect: config.reconnect.enabled,
            enable_heartbeat: config.heartbeat.enabled,
            heartbeat_interval: config.heartbeat.interval.as_secs_f64(),
            max_reconnect_attempts: config.reconnect.max_attempts,
        }
    }
}

/// Combined client snapshot, republished on every state change and manager callback.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Human readable connection state
    pub connection_state: String,
    pub is_connected: bool,
    pub heartbeat: HeartbeatStats,
    pub reconnection: ReconnectionStats,
    pub config: ConfigSummary,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_camel_case_layout() {
        let config = Config::builder()
            .url("wss://example.com/ws")
            .build();
        let stats = ConnectionStats {
            connection_state: "Disconnected".to_owned(),
            is_connected: false,
            heartbeat: HeartbeatStats {
                is_active: false,
                missed_heartbeats: 0,
                waiting_for_pong: false,
                last_heartbeat_sent: None,
                last_pong_received: None,
                heartbeat_interval: Duration::from_millis(1500).as_secs_f64(),
                max_missed_heartbeats: 3,
            },
            reconnection: ReconnectionStats {
                is_reconnecting: false,
                reconnect_attempts: 0,
                max_reconnect_attempts: 5,
                current_delay: 1.0,
                next_attempt_in: NextAttempt::NotScheduled,
            },
            config: ConfigSummary::from(&config),
        };

        let value = serde_json::to_value(&stats).unwrap();

        assert_eq!(value["connectionState"], json!("Disconnected"));
        assert_eq!(value["heartbeat"]["heartbeatInterval"], json!(1.5));
        assert_eq!(value["heartbeat"]["lastPongReceived"], json!(null));
        assert_eq!(value["reconnection"]["nextAttemptIn"], json!("not scheduled"));
        assert_eq!(value["config"]["url"], json!("wss://example.com/ws"));
        assert_eq!(value["config"]["autoReconnect"], json!(true));
        assert_eq!(value["config"]["heartbeatInterval"], json!(30.0));
    }
}

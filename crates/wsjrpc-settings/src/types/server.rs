//! Hub-side settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hub network settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Connections accepted before upgrades are refused.
    pub max_connections: usize,
    /// Interval between Ping frames.
    pub heartbeat_interval_ms: u64,
    /// Close the socket after this long without a Pong.
    pub heartbeat_timeout_ms: u64,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 256,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Call correlation and handler limits, shared by the hub and peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcSettings {
    /// Deadline for an outbound correlated call.
    pub call_timeout_ms: u64,
    /// Upper bound on a single local handler execution.
    pub handler_timeout_ms: u64,
}

impl RpcSettings {
    /// Call timeout as a [`Duration`].
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Handler timeout as a [`Duration`].
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            handler_timeout_ms: 60_000,
        }
    }
}

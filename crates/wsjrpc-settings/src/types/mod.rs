//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a partial
//! JSON file only needs the keys it overrides.

mod client;
mod server;

pub use client::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use wsjrpc_logging::{LogFormat, LogLevel};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "rpc": { "callTimeoutMs": 5000 },
///   "logging": { "level": "debug", "format": "json" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WsjrpcSettings {
    /// Hub network settings.
    pub server: ServerSettings,
    /// Call correlation and handler limits.
    pub rpc: RpcSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// Peer-side connection settings.
    pub client: ClientSettings,
}

impl WsjrpcSettings {
    /// Reject values that would make the hub or a peer unusable.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be non-zero".into(),
            ));
        }
        if self.server.heartbeat_timeout_ms < self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutMs must not be shorter than the interval".into(),
            ));
        }
        if self.rpc.call_timeout_ms == 0 || self.rpc.handler_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "rpc timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` still wins when set).
    pub level: LogLevel,
    /// `pretty` or `json`.
    pub format: LogFormat,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_are_valid() {
        assert!(WsjrpcSettings::default().validate().is_ok());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(WsjrpcSettings::default()).unwrap();
        assert!(json["server"]["maxConnections"].is_number());
        assert!(json["rpc"]["callTimeoutMs"].is_number());
        assert_eq!(json["logging"]["level"], "info");
        assert_eq!(json["logging"]["format"], "pretty");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: WsjrpcSettings =
            serde_json::from_str(r#"{"logging": {"format": "json"}}"#).unwrap();
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(settings.logging.level, LogLevel::Info);
        assert_eq!(settings.server.port, 8080);
    }

    #[test]
    fn zero_call_timeout_rejected() {
        let mut settings = WsjrpcSettings::default();
        settings.rpc.call_timeout_ms = 0;
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn heartbeat_timeout_shorter_than_interval_rejected() {
        let mut settings = WsjrpcSettings::default();
        settings.server.heartbeat_interval_ms = 10_000;
        settings.server.heartbeat_timeout_ms = 5_000;
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(msg)) => {
            assert!(msg.contains("heartbeatTimeoutMs"));
        });
    }

    #[test]
    fn zero_max_connections_rejected() {
        let mut settings = WsjrpcSettings::default();
        settings.server.max_connections = 0;
        assert!(settings.validate().is_err());
    }
}

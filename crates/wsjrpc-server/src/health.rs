//! `/health` endpoint.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the hub is running.
    pub status: String,
    /// Seconds since the hub started.
    pub uptime_secs: u64,
    /// Open WebSocket connections.
    pub connections: usize,
    /// Connections that have introduced themselves.
    pub introduced: usize,
    /// Forwarded calls awaiting a reply.
    pub pending_calls: usize,
    /// Wall-clock start time, RFC 3339.
    pub started_at: String,
}

/// Live counters feeding [`health_check`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HubCounters {
    /// Open connections.
    pub connections: usize,
    /// Introduced connections.
    pub introduced: usize,
    /// Pending forwarded calls.
    pub pending_calls: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, started_at: DateTime<Utc>, counters: HubCounters) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: counters.connections,
        introduced: counters.introduced,
        pending_calls: counters.pending_calls,
        started_at: started_at.to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), Utc::now(), HubCounters::default());
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, Utc::now(), HubCounters::default());
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization_uses_camel_case() {
        let counters = HubCounters {
            connections: 3,
            introduced: 2,
            pending_calls: 1,
        };
        let resp = health_check(Instant::now(), Utc::now(), counters);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 3);
        assert_eq!(parsed["introduced"], 2);
        assert_eq!(parsed["pendingCalls"], 1);
        assert!(parsed["uptimeSecs"].is_number());
        assert!(parsed["startedAt"].is_string());
    }
}

//! Peer-side settings.

use serde::{Deserialize, Serialize};

/// Where a peer connects and how it introduces itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Hub WebSocket URL.
    pub url: String,
    /// Name announced via `introduce`. `None` lets the binary pick one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080".to_string(),
            name: None,
        }
    }
}

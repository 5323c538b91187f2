//! Peer error type.

use tokio_tungstenite::tungstenite;
use wsjrpc_rpc::RpcError;

/// Failure to connect, hand-shake, or talk to the hub.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Socket-level failure.
    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    /// A handshake call to the hub was rejected.
    #[error("handshake step '{step}' failed: {source}")]
    Handshake {
        /// Hub procedure that failed.
        step: &'static str,
        /// What the hub answered.
        #[source]
        source: RpcError,
    },

    /// Local registration or call failure.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The connection has ended.
    #[error("peer connection is closed")]
    Closed,
}

impl From<tungstenite::Error> for ClientError {
    fn from(error: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(error))
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ClientError>;

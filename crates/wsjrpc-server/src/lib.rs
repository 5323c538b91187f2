//! # wsjrpc-server
//!
//! The JSON-RPC hub.
//!
//! - [`directory`]: per-connection identity state and declared subscriptions
//! - [`broker`]: hub procedures (`introduce`, `registerMethod`, `subscribe`,
//!   `broadcast`, `list`) and the close cascade
//! - [`server`]: Axum router with the WebSocket gateway, `/health`, `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod broker;
pub mod config;
pub mod directory;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use broker::{Broker, HUB_NAME, PeerSummary};
pub use config::ServerConfig;
pub use directory::{Directory, DirectoryRecord, Identity, PeerState};
pub use server::HubServer;
pub use shutdown::ShutdownCoordinator;

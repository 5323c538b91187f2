//! # wsjrpc-client
//!
//! A peer of the JSON-RPC hub.
//!
//! [`PeerBuilder`] collects the procedures a peer exposes and the events it
//! listens to, connects, and runs the `introduce` / `registerMethod` /
//! `subscribe` handshake. The resulting [`Peer`] can then call other peers
//! through the hub as `<peer>.<method>`.

#![deny(unsafe_code)]

pub mod errors;
pub mod peer;
pub mod transport;

pub use errors::{ClientError, Result};
pub use peer::{Peer, PeerBuilder};
pub use transport::WsStream;

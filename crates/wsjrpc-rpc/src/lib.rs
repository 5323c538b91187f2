//! # wsjrpc-rpc
//!
//! The peer-symmetric JSON-RPC 2.0 core used by both the hub and its peers.
//!
//! - [`envelope`]: wire codec for requests, responses, errors, and notifications
//! - [`correlator`]: outbound call ids, pending table, timeouts
//! - [`registry`]: method name to handler, async dispatch
//! - [`subscriptions`]: notification name to local subscribers
//! - [`endpoint`]: routes each inbound envelope to one of the above
//!
//! The transport is not part of this crate. It hands inbound text to
//! [`Endpoint::handle_text`] and drains the queue behind each [`Connection`].

#![deny(unsafe_code)]

pub mod connection;
pub mod correlator;
pub mod endpoint;
pub mod envelope;
pub mod errors;
pub mod params;
pub mod registry;
pub mod subscriptions;

pub use connection::{Connection, ConnectionId};
pub use correlator::{Correlator, DEFAULT_CALL_TIMEOUT, PendingReply};
pub use endpoint::{Endpoint, Released};
pub use envelope::{DecodeError, Envelope, ErrorObject, Frame, RequestId, decode, encode};
pub use errors::RpcError;
pub use registry::{CallContext, InlineFn, MethodHandler, MethodRegistry, handler_fn};
pub use subscriptions::{Subscriber, SubscriberId, SubscriptionTable};

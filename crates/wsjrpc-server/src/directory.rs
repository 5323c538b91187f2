//! Per-connection identity and declared subscriptions.
//!
//! Every live connection has a record from open to close. A record starts
//! anonymous and becomes introduced on `introduce`; removal on close is the
//! `Closed` state, so a detached id always reports [`PeerState::Closed`].

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use wsjrpc_rpc::{Connection, ConnectionId, RpcError};

/// Identity lifecycle of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Connected, has not introduced itself.
    Anonymous,
    /// Holds a name and description.
    Introduced,
    /// No longer attached.
    Closed,
}

/// Name and description declared by `introduce`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Peer name; prefix of every method and event it owns.
    pub name: String,
    /// Free-form description.
    pub description: String,
}

/// One attached connection.
#[derive(Clone, Debug)]
pub struct DirectoryRecord {
    /// Outbound handle.
    pub connection: Arc<Connection>,
    /// `None` until introduced.
    pub identity: Option<Identity>,
    /// Subscribed event names, in first-subscribed order, without duplicates.
    pub subscriptions: Vec<String>,
}

impl DirectoryRecord {
    /// Current state.
    pub fn state(&self) -> PeerState {
        if self.identity.is_some() {
            PeerState::Introduced
        } else {
            PeerState::Anonymous
        }
    }
}

/// All attached connections in insertion order.
#[derive(Default)]
pub struct Directory {
    records: RwLock<Vec<DirectoryRecord>>,
}

impl Directory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened connection as anonymous.
    pub fn attach(&self, connection: Arc<Connection>) {
        self.records.write().push(DirectoryRecord {
            connection,
            identity: None,
            subscriptions: Vec::new(),
        });
    }

    /// Set or overwrite the identity of `id`.
    ///
    /// Returns the previous identity, or `Err(Closed)` for a detached id.
    pub fn introduce(&self, id: &ConnectionId, identity: Identity) -> Result<Option<Identity>, PeerState> {
        let mut records = self.records.write();
        let record = records
            .iter_mut()
            .find(|r| r.connection.id() == id)
            .ok_or(PeerState::Closed)?;
        Ok(record.identity.replace(identity))
    }

    /// State of `id`.
    pub fn state(&self, id: &ConnectionId) -> PeerState {
        self.records
            .read()
            .iter()
            .find(|r| r.connection.id() == id)
            .map_or(PeerState::Closed, DirectoryRecord::state)
    }

    /// Identity of `id`, failing with [`RpcError::NotIntroduced`] otherwise.
    pub fn require_introduced(&self, id: &ConnectionId) -> Result<Identity, RpcError> {
        self.records
            .read()
            .iter()
            .find(|r| r.connection.id() == id)
            .and_then(|r| r.identity.clone())
            .ok_or(RpcError::NotIntroduced)
    }

    /// Record `event` for an introduced connection.
    ///
    /// Returns whether the name was new for this connection.
    pub fn add_subscription(&self, id: &ConnectionId, event: &str) -> Result<bool, RpcError> {
        let mut records = self.records.write();
        let record = records
            .iter_mut()
            .find(|r| r.connection.id() == id && r.identity.is_some())
            .ok_or(RpcError::NotIntroduced)?;
        if record.subscriptions.iter().any(|s| s == event) {
            return Ok(false);
        }
        record.subscriptions.push(event.to_owned());
        Ok(true)
    }

    /// Snapshot of introduced connections subscribed to `event`, minus `exclude`.
    pub fn subscribers_of(&self, event: &str, exclude: &ConnectionId) -> Vec<Arc<Connection>> {
        self.records
            .read()
            .iter()
            .filter(|r| r.identity.is_some() && r.connection.id() != exclude)
            .filter(|r| r.subscriptions.iter().any(|s| s == event))
            .map(|r| Arc::clone(&r.connection))
            .collect()
    }

    /// Remove `id`, returning its last record.
    pub fn detach(&self, id: &ConnectionId) -> Option<DirectoryRecord> {
        let mut records = self.records.write();
        let index = records.iter().position(|r| r.connection.id() == id)?;
        Some(records.remove(index))
    }

    /// Point-in-time copy of every record, in insertion order.
    pub fn snapshot(&self) -> Vec<DirectoryRecord> {
        self.records.read().clone()
    }

    /// Number of attached connections.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no connection is attached.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Number of introduced connections.
    pub fn introduced_count(&self) -> usize {
        self.records
            .read()
            .iter()
            .filter(|r| r.identity.is_some())
            .count()
    }
}

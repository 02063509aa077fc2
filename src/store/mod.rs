//! Coordination store interface
//!
//! The client talks to the store through two traits:
//!
//! - [`StoreConnector`] opens sessions. Opening returns at once; the session
//!   later reports establishment, disconnection and expiry to the session
//!   watcher as [`EventType::Session`] events.
//! - [`StoreSession`] issues node operations. Every operation completes
//!   through a callback that may run on any store thread.
//!
//! Node watches handed to a session are one-shot and only ever receive node
//! events. Session-level notifications go to the session watcher alone.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordError, StoreCode};

/// Session identity issued by the store.
pub type SessionId = i64;

/// Version argument matching any node version.
pub const ANY_VERSION: i32 = -1;

/// Store-side watch or session watcher.
pub type Watcher = Arc<dyn Fn(WatchedEvent) + Send + Sync>;

/// Completion callback for a store operation.
pub type StoreCallback<T> = Box<dyn FnOnce(Result<T, StoreCode>) + Send>;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// Survives session loss
    Persistent,
    /// Persistent, with a store-assigned increasing suffix
    PersistentSequential,
    /// Removed when the creating session ends
    Ephemeral,
    /// Ephemeral, with a store-assigned increasing suffix
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_sequential(self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }
}

/// Node metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Transaction that created the node
    pub czxid: i64,
    /// Transaction that last modified the node's data
    pub mzxid: i64,
    /// Transaction that last changed the node's children
    pub pzxid: i64,
    /// Creation time (ms since epoch)
    pub ctime: u64,
    /// Last modification time (ms since epoch)
    pub mtime: u64,
    /// Data version
    pub version: i32,
    /// Children version
    pub cversion: i32,
    /// Owning session for ephemeral nodes, 0 otherwise
    pub ephemeral_owner: SessionId,
    pub data_length: usize,
    pub num_children: usize,
}

/// Result of a data read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub data: Vec<u8>,
    pub stat: Stat,
}

/// Result of a children listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeChildren {
    /// Child names (not full paths), sorted
    pub children: Vec<String>,
    pub stat: Stat,
}

/// What a watch notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Session state change; no node involved
    Session,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// Session state carried by a watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    SyncConnected,
    Expired,
    AuthFailed,
    /// Session closed by the client
    Closed,
}

/// A watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub state: SessionState,
    pub path: Option<String>,
}

impl WatchedEvent {
    /// Node event on a connected session.
    pub fn node(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            state: SessionState::SyncConnected,
            path: Some(path.into()),
        }
    }

    /// Session state change.
    pub fn session(state: SessionState) -> Self {
        Self {
            event_type: EventType::Session,
            state,
            path: None,
        }
    }

    pub(crate) fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Opens sessions against a coordination store.
pub trait StoreConnector: Send + Sync {
    /// Start opening a session. `watcher` receives the session's state changes.
    fn connect(
        &self,
        session_timeout: Duration,
        watcher: Watcher,
    ) -> Result<Arc<dyn StoreSession>, CoordError>;
}

/// One live session with the store.
pub trait StoreSession: Send + Sync {
    fn session_id(&self) -> SessionId;

    /// Create a node; the callback receives the path actually created.
    fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode, callback: StoreCallback<String>);

    /// Stat a node. Reports [`StoreCode::NoNode`] for an absent node but still
    /// arms `watcher` so it fires on creation.
    fn exists(&self, path: &str, watcher: Option<Watcher>, callback: StoreCallback<Stat>);

    fn get_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
        callback: StoreCallback<NodeChildren>,
    );

    fn get_data(&self, path: &str, watcher: Option<Watcher>, callback: StoreCallback<NodeData>);

    fn set_data(&self, path: &str, data: Vec<u8>, version: i32, callback: StoreCallback<Stat>);

    fn delete(&self, path: &str, version: i32, callback: StoreCallback<()>);

    /// Close the session. Outstanding callbacks may still fire.
    fn close(&self);
}

//! Bookkeeping for in-flight operations and armed watches
//!
//! Both registries are keyed by a client-assigned id and tag every entry with
//! the session generation it was issued on, so an expiring session can fail
//! exactly its own work. Removal is the settlement token: whoever removes an
//! entry owns its callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::CoordError;
use crate::store::WatchedEvent;

/// Session generation; bumped every time a session is opened or the client stops.
pub(crate) type Generation = u64;

/// Caller-supplied watch reaction.
pub type WatchCallback = Box<dyn FnOnce(WatchedEvent) + Send>;

pub(crate) type FailFn = Box<dyn FnOnce(CoordError) + Send>;

/// Which node operation an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Create,
    Exists,
    GetChildren,
    GetData,
    SetData,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Exists => "exists",
            OpKind::GetChildren => "get_children",
            OpKind::GetData => "get_data",
            OpKind::SetData => "set_data",
            OpKind::Delete => "delete",
        }
    }
}

/// What an armed watch observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Creation, deletion or data change of a possibly absent node
    Exists,
    /// Deletion or data change of a node that exists; an absent node leaves
    /// nothing armed
    Presence,
    /// Data change or deletion of an existing node
    Data,
    /// Child list change or deletion
    Children,
}

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PendingEntry {
    generation: Generation,
    kind: OpKind,
    path: String,
    fail: FailFn,
}

/// A pending operation removed from the registry without completing.
pub(crate) struct Abandoned {
    pub kind: OpKind,
    pub path: String,
    pub fail: FailFn,
}

#[derive(Default)]
pub(crate) struct PendingOperations {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, PendingEntry>>,
}

impl PendingOperations {
    pub fn register(&self, generation: Generation, kind: OpKind, path: &str, fail: FailFn) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).insert(
            id,
            PendingEntry {
                generation,
                kind,
                path: path.to_string(),
                fail,
            },
        );
        id
    }

    /// Remove a completed operation. Returns `false` if it had already been
    /// abandoned.
    pub fn complete(&self, id: u64) -> bool {
        lock(&self.entries).remove(&id).is_some()
    }

    /// Remove every operation issued on `generation`.
    pub fn drain_generation(&self, generation: Generation) -> Vec<Abandoned> {
        let mut entries = lock(&self.entries);
        let ids: Vec<u64> = entries
            .iter()
            .filter(|(_, entry)| entry.generation == generation)
            .map(|(id, _)| *id)
            .collect();
        let mut drained: Vec<(u64, Abandoned)> = ids
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|entry| (id, entry.into())))
            .collect();
        drained.sort_by_key(|(id, _)| *id);
        drained.into_iter().map(|(_, op)| op).collect()
    }

    pub fn drain_all(&self) -> Vec<Abandoned> {
        let mut drained: Vec<(u64, PendingEntry)> = lock(&self.entries).drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained.into_iter().map(|(_, entry)| entry.into()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

impl From<PendingEntry> for Abandoned {
    fn from(entry: PendingEntry) -> Self {
        Self {
            kind: entry.kind,
            path: entry.path,
            fail: entry.fail,
        }
    }
}

struct WatchEntry {
    generation: Generation,
    kind: WatchKind,
    path: String,
    callback: WatchCallback,
}

/// A watch removed from the registry without firing.
pub(crate) struct Dropped {
    pub kind: WatchKind,
    pub path: String,
    pub callback: WatchCallback,
}

#[derive(Default)]
pub(crate) struct WatchRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, WatchEntry>>,
}

impl WatchRegistry {
    pub fn register(
        &self,
        generation: Generation,
        kind: WatchKind,
        path: &str,
        callback: WatchCallback,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).insert(
            id,
            WatchEntry {
                generation,
                kind,
                path: path.to_string(),
                callback,
            },
        );
        id
    }

    /// Take the callback of a watch that fired. `None` if it was already
    /// fired, discarded or dropped with its session.
    pub fn take(&self, id: u64) -> Option<WatchCallback> {
        lock(&self.entries).remove(&id).map(|entry| entry.callback)
    }

    /// Forget a watch the store never armed.
    pub fn discard(&self, id: u64) {
        lock(&self.entries).remove(&id);
    }

    pub fn drain_generation(&self, generation: Generation) -> Vec<Dropped> {
        let mut entries = lock(&self.entries);
        let mut ids: Vec<u64> = entries
            .iter()
            .filter(|(_, entry)| entry.generation == generation)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| entries.remove(&id))
            .map(Dropped::from)
            .collect()
    }

    pub fn drain_all(&self) -> Vec<Dropped> {
        let mut drained: Vec<(u64, WatchEntry)> = lock(&self.entries).drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained.into_iter().map(|(_, entry)| entry.into()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

impl From<WatchEntry> for Dropped {
    fn from(entry: WatchEntry) -> Self {
        Self {
            kind: entry.kind,
            path: entry.path,
            callback: entry.callback,
        }
    }
}

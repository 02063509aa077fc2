//! Node operations
//!
//! Every operation validates its path, returns an [`OperationFuture`]
//! immediately and settles it on the event executor.

use std::sync::Arc;

use tracing::{debug, error};

use super::{CoordinationClient, Inner, OpKind, WatchCallback, WatchKind};
use crate::error::CoordError;
use crate::future::{OperationFuture, OperationResult, SettableOperationFuture};
use crate::path;
use crate::store::{
    CreateMode, NodeChildren, NodeData, Stat, StoreCallback, StoreSession, WatchedEvent, Watcher,
    ANY_VERSION,
};

type Settle<T> = Box<dyn FnOnce(OperationResult<T>) + Send>;

impl CoordinationClient {
    /// Create a node, creating missing parents when `auto_create_parents` is
    /// configured. Resolves with the path actually created, which differs
    /// from `path` for sequential modes.
    pub fn create(
        &self,
        path: &str,
        data: impl Into<Vec<u8>>,
        mode: CreateMode,
    ) -> OperationFuture<String> {
        self.create_with(path, data, mode, self.inner.config.auto_create_parents)
    }

    /// Create a node. With `create_parent`, missing ancestors are created
    /// first as empty persistent nodes.
    pub fn create_with(
        &self,
        path: &str,
        data: impl Into<Vec<u8>>,
        mode: CreateMode,
        create_parent: bool,
    ) -> OperationFuture<String> {
        let result = SettableOperationFuture::new(path);
        if let Err(e) = path::validate(path) {
            self.inner.reject(&result, e);
            return result.future();
        }

        let settle = result.clone();
        self.inner.create_node(
            path.to_string(),
            data.into(),
            mode,
            create_parent,
            Box::new(move |outcome| {
                settle.complete(outcome);
            }),
        );
        result.future()
    }

    /// Stat a node. An absent node resolves to `None`.
    pub fn exists(&self, path: &str) -> OperationFuture<Option<Stat>> {
        self.exists_inner(path, None)
    }

    /// Stat a node and watch it for creation, deletion or data change. The
    /// watch is armed even when the node is absent.
    pub fn exists_with_watch<W>(&self, path: &str, watcher: W) -> OperationFuture<Option<Stat>>
    where
        W: FnOnce(WatchedEvent) + Send + 'static,
    {
        self.exists_inner(path, Some((WatchKind::Exists, Box::new(watcher))))
    }

    /// Stat a node and watch it only if it exists. Unlike
    /// [`exists_with_watch`](Self::exists_with_watch), an absent node leaves
    /// no watch behind.
    pub fn exists_with_presence_watch<W>(
        &self,
        path: &str,
        watcher: W,
    ) -> OperationFuture<Option<Stat>>
    where
        W: FnOnce(WatchedEvent) + Send + 'static,
    {
        self.exists_inner(path, Some((WatchKind::Presence, Box::new(watcher))))
    }

    pub fn get_children(&self, path: &str) -> OperationFuture<NodeChildren> {
        self.get_children_inner(path, None)
    }

    pub fn get_children_with_watch<W>(&self, path: &str, watcher: W) -> OperationFuture<NodeChildren>
    where
        W: FnOnce(WatchedEvent) + Send + 'static,
    {
        self.get_children_inner(path, Some((WatchKind::Children, Box::new(watcher))))
    }

    pub fn get_data(&self, path: &str) -> OperationFuture<NodeData> {
        self.get_data_inner(path, None)
    }

    pub fn get_data_with_watch<W>(&self, path: &str, watcher: W) -> OperationFuture<NodeData>
    where
        W: FnOnce(WatchedEvent) + Send + 'static,
    {
        self.get_data_inner(path, Some((WatchKind::Data, Box::new(watcher))))
    }

    /// Overwrite a node's data regardless of its version.
    pub fn set_data(&self, path: &str, data: impl Into<Vec<u8>>) -> OperationFuture<Stat> {
        self.set_data_versioned(path, data, ANY_VERSION)
    }

    /// Overwrite a node's data if its version still equals `version`.
    pub fn set_data_versioned(
        &self,
        path: &str,
        data: impl Into<Vec<u8>>,
        version: i32,
    ) -> OperationFuture<Stat> {
        let data = data.into();
        self.run(
            OpKind::SetData,
            path,
            None,
            move |session, path, _, callback| session.set_data(path, data, version, callback),
            |outcome: OperationResult<Stat>| outcome,
        )
    }

    /// Delete a node regardless of its version. Resolves with the deleted path.
    pub fn delete(&self, path: &str) -> OperationFuture<String> {
        self.delete_versioned(path, ANY_VERSION)
    }

    pub fn delete_versioned(&self, path: &str, version: i32) -> OperationFuture<String> {
        let deleted = path.to_string();
        self.run(
            OpKind::Delete,
            path,
            None,
            move |session, path, _, callback| session.delete(path, version, callback),
            move |outcome: OperationResult<()>| outcome.map(|()| deleted),
        )
    }

    fn exists_inner(
        &self,
        path: &str,
        watch: Option<(WatchKind, WatchCallback)>,
    ) -> OperationFuture<Option<Stat>> {
        self.run(
            OpKind::Exists,
            path,
            watch,
            |session, path, watcher, callback| session.exists(path, watcher, callback),
            |outcome: OperationResult<Stat>| match outcome {
                Ok(stat) => Ok(Some(stat)),
                Err(CoordError::NodeNotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
        )
    }

    fn get_children_inner(
        &self,
        path: &str,
        watch: Option<(WatchKind, WatchCallback)>,
    ) -> OperationFuture<NodeChildren> {
        self.run(
            OpKind::GetChildren,
            path,
            watch,
            |session, path, watcher, callback| session.get_children(path, watcher, callback),
            |outcome: OperationResult<NodeChildren>| outcome,
        )
    }

    fn get_data_inner(
        &self,
        path: &str,
        watch: Option<(WatchKind, WatchCallback)>,
    ) -> OperationFuture<NodeData> {
        self.run(
            OpKind::GetData,
            path,
            watch,
            |session, path, watcher, callback| session.get_data(path, watcher, callback),
            |outcome: OperationResult<NodeData>| outcome,
        )
    }

    fn run<T, R, I, M>(
        &self,
        kind: OpKind,
        path: &str,
        watch: Option<(WatchKind, WatchCallback)>,
        issue: I,
        map: M,
    ) -> OperationFuture<R>
    where
        T: Send + 'static,
        R: Send + Sync + 'static,
        I: FnOnce(&dyn StoreSession, &str, Option<Watcher>, StoreCallback<T>) + Send + 'static,
        M: FnOnce(OperationResult<T>) -> OperationResult<R> + Send + 'static,
    {
        let result = SettableOperationFuture::new(path);
        if let Err(e) = path::validate(path) {
            self.inner.reject(&result, e);
            return result.future();
        }

        let settle = result.clone();
        self.inner
            .call(kind, path.to_string(), watch, issue, move |outcome| {
                settle.complete(map(outcome));
            });
        result.future()
    }
}

impl Inner {
    fn create_node(
        self: &Arc<Self>,
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
        create_parent: bool,
        done: Settle<String>,
    ) {
        let inner = Arc::clone(self);
        let payload = data.clone();
        self.call(
            OpKind::Create,
            path.clone(),
            None,
            move |session, path, _, callback| session.create(path, payload, mode, callback),
            move |outcome: OperationResult<String>| match outcome {
                Err(CoordError::NodeNotFound(_)) if create_parent => {
                    inner.create_parent_then_retry(path, data, mode, done)
                }
                outcome => done(outcome),
            },
        );
    }

    /// Create the parent of `path`, then retry `path` once without
    /// auto-parenting. Recursion is bounded by the depth of `path`.
    fn create_parent_then_retry(
        self: &Arc<Self>,
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
        done: Settle<String>,
    ) {
        let Some(parent) = path::parent(&path).map(str::to_string) else {
            error!(path = %path, "Root node missing, cannot create a parent above it");
            done(Err(CoordError::invalid_path(&path, "root node does not exist")));
            return;
        };

        debug!(path = %path, parent = %parent, "Creating missing parent");
        let inner = Arc::clone(self);
        self.create_node(
            parent,
            Vec::new(),
            CreateMode::Persistent,
            true,
            Box::new(move |outcome| match outcome {
                Ok(_) | Err(CoordError::NodeAlreadyExists(_)) => {
                    inner.create_node(path, data, mode, false, done)
                }
                Err(e) => done(Err(e)),
            }),
        );
    }
}

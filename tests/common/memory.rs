//! In-memory coordination store
//!
//! A complete [`StoreConnector`] that lives inside the test process. One server
//! thread owns the node tree and processes requests from every session in
//! arrival order, so watch notifications and operation callbacks come out in a
//! single total order. Notifications triggered by an operation are emitted
//! before that operation's callback.
//!
//! The admin methods on [`InMemoryStore`] act outside any session. Tests use
//! them to play remote processes (consuming a message node, say) and to inject
//! session failures.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use elohim_coord::error::{CoordError, StoreCode};
use elohim_coord::path::{self, ROOT};
use elohim_coord::store::{
    CreateMode, EventType, NodeChildren, NodeData, SessionId, SessionState, Stat, StoreCallback,
    StoreConnector, StoreSession, WatchedEvent, Watcher, ANY_VERSION,
};

enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
        callback: StoreCallback<String>,
    },
    Exists {
        path: String,
        watcher: Option<Watcher>,
        callback: StoreCallback<Stat>,
    },
    GetChildren {
        path: String,
        watcher: Option<Watcher>,
        callback: StoreCallback<NodeChildren>,
    },
    GetData {
        path: String,
        watcher: Option<Watcher>,
        callback: StoreCallback<NodeData>,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: i32,
        callback: StoreCallback<Stat>,
    },
    Delete {
        path: String,
        version: i32,
        callback: StoreCallback<()>,
    },
}

impl Op {
    fn fail(self, code: StoreCode) {
        match self {
            Op::Create { callback, .. } => callback(Err(code)),
            Op::Exists { callback, .. } => callback(Err(code)),
            Op::GetChildren { callback, .. } => callback(Err(code)),
            Op::GetData { callback, .. } => callback(Err(code)),
            Op::SetData { callback, .. } => callback(Err(code)),
            Op::Delete { callback, .. } => callback(Err(code)),
        }
    }
}

enum Request {
    Open {
        session: SessionId,
        timeout: Duration,
        watcher: Watcher,
        announce: bool,
    },
    Op {
        session: Option<SessionId>,
        op: Op,
    },
    Close {
        session: SessionId,
    },
    Expire {
        session: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        session: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Reconnect {
        session: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionId>>,
    },
}

fn send_op(tx: &mpsc::Sender<Request>, session: Option<SessionId>, op: Op) {
    if let Err(mpsc::SendError(Request::Op { op, .. })) = tx.send(Request::Op { session, op }) {
        op.fail(StoreCode::ConnectionLoss);
    }
}

/// Handle on an in-process store. Clones share the same tree.
#[derive(Clone)]
pub struct InMemoryStore {
    tx: mpsc::Sender<Request>,
    next_session: Arc<AtomicI64>,
    accepting: Arc<AtomicBool>,
    handshakes_suspended: Arc<AtomicBool>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Start a store holding only the root node.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let server = Server::new();
        if let Err(e) = thread::Builder::new()
            .name("memory-store-server".to_string())
            .spawn(move || server.run(rx))
        {
            warn!(error = %e, "Failed to spawn in-memory store server");
        }

        Self {
            tx,
            next_session: Arc::new(AtomicI64::new(1)),
            accepting: Arc::new(AtomicBool::new(true)),
            handshakes_suspended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make `connect` fail until re-enabled.
    pub fn refuse_connections(&self, refuse: bool) {
        self.accepting.store(!refuse, Ordering::SeqCst);
    }

    /// Sessions opened while suspended never report establishment.
    pub fn suspend_handshakes(&self, suspend: bool) {
        self.handshakes_suspended.store(suspend, Ordering::SeqCst);
    }

    pub async fn create(
        &self,
        path: &str,
        data: impl Into<Vec<u8>>,
        mode: CreateMode,
    ) -> Result<String, StoreCode> {
        let (path, data) = (path.to_string(), data.into());
        self.admin(move |callback| Op::Create {
            path,
            data,
            mode,
            callback,
        })
        .await
    }

    pub async fn delete(&self, path: &str) -> Result<(), StoreCode> {
        let path = path.to_string();
        self.admin(move |callback| Op::Delete {
            path,
            version: ANY_VERSION,
            callback,
        })
        .await
    }

    pub async fn set_data(&self, path: &str, data: impl Into<Vec<u8>>) -> Result<Stat, StoreCode> {
        let (path, data) = (path.to_string(), data.into());
        self.admin(move |callback| Op::SetData {
            path,
            data,
            version: ANY_VERSION,
            callback,
        })
        .await
    }

    pub async fn get_data(&self, path: &str) -> Result<NodeData, StoreCode> {
        let path = path.to_string();
        self.admin(move |callback| Op::GetData {
            path,
            watcher: None,
            callback,
        })
        .await
    }

    /// Child names of `path`, sorted.
    pub async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreCode> {
        let path = path.to_string();
        self.admin(move |callback| Op::GetChildren {
            path,
            watcher: None,
            callback,
        })
        .await
        .map(|listing| listing.children)
    }

    pub async fn exists(&self, path: &str) -> Option<Stat> {
        let path = path.to_string();
        self.admin(move |callback| Op::Exists {
            path,
            watcher: None,
            callback,
        })
        .await
        .ok()
    }

    /// Expire a session: its ephemeral nodes go away, its watches are dropped
    /// and its session watcher sees [`SessionState::Expired`].
    pub async fn expire_session(&self, session: SessionId) -> bool {
        self.ask(|reply| Request::Expire { session, reply })
            .await
            .unwrap_or(false)
    }

    /// Simulate a transient connection drop.
    pub async fn disconnect_session(&self, session: SessionId) -> bool {
        self.ask(|reply| Request::Disconnect { session, reply })
            .await
            .unwrap_or(false)
    }

    /// Restore a session dropped by [`Self::disconnect_session`].
    pub async fn reconnect_session(&self, session: SessionId) -> bool {
        self.ask(|reply| Request::Reconnect { session, reply })
            .await
            .unwrap_or(false)
    }

    /// Sessions that have neither expired nor been closed.
    pub async fn sessions(&self) -> Vec<SessionId> {
        self.ask(|reply| Request::Sessions { reply })
            .await
            .unwrap_or_default()
    }

    async fn admin<T, B>(&self, build: B) -> Result<T, StoreCode>
    where
        T: Send + 'static,
        B: FnOnce(StoreCallback<T>) -> Op,
    {
        let (reply, response) = oneshot::channel();
        let op = build(Box::new(move |result| {
            let _ = reply.send(result);
        }));
        send_op(&self.tx, None, op);
        response.await.unwrap_or(Err(StoreCode::ConnectionLoss))
    }

    async fn ask<T, B>(&self, build: B) -> Option<T>
    where
        B: FnOnce(oneshot::Sender<T>) -> Request,
    {
        let (reply, response) = oneshot::channel();
        self.tx.send(build(reply)).ok()?;
        response.await.ok()
    }
}

impl StoreConnector for InMemoryStore {
    fn connect(
        &self,
        session_timeout: Duration,
        watcher: Watcher,
    ) -> Result<Arc<dyn StoreSession>, CoordError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(CoordError::ConnectFailed(
                "in-memory store is refusing connections".to_string(),
            ));
        }

        let session = self.next_session.fetch_add(1, Ordering::SeqCst);
        let announce = !self.handshakes_suspended.load(Ordering::SeqCst);
        self.tx
            .send(Request::Open {
                session,
                timeout: session_timeout,
                watcher,
                announce,
            })
            .map_err(|_| CoordError::ConnectFailed("in-memory store has shut down".to_string()))?;

        Ok(Arc::new(MemorySession {
            id: session,
            tx: self.tx.clone(),
        }))
    }
}

struct MemorySession {
    id: SessionId,
    tx: mpsc::Sender<Request>,
}

impl MemorySession {
    fn submit(&self, op: Op) {
        send_op(&self.tx, Some(self.id), op);
    }
}

impl StoreSession for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode, callback: StoreCallback<String>) {
        self.submit(Op::Create {
            path: path.to_string(),
            data,
            mode,
            callback,
        });
    }

    fn exists(&self, path: &str, watcher: Option<Watcher>, callback: StoreCallback<Stat>) {
        self.submit(Op::Exists {
            path: path.to_string(),
            watcher,
            callback,
        });
    }

    fn get_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
        callback: StoreCallback<NodeChildren>,
    ) {
        self.submit(Op::GetChildren {
            path: path.to_string(),
            watcher,
            callback,
        });
    }

    fn get_data(&self, path: &str, watcher: Option<Watcher>, callback: StoreCallback<NodeData>) {
        self.submit(Op::GetData {
            path: path.to_string(),
            watcher,
            callback,
        });
    }

    fn set_data(&self, path: &str, data: Vec<u8>, version: i32, callback: StoreCallback<Stat>) {
        self.submit(Op::SetData {
            path: path.to_string(),
            data,
            version,
            callback,
        });
    }

    fn delete(&self, path: &str, version: i32, callback: StoreCallback<()>) {
        self.submit(Op::Delete {
            path: path.to_string(),
            version,
            callback,
        });
    }

    fn close(&self) {
        let _ = self.tx.send(Request::Close { session: self.id });
    }
}

// =============================================================================
// Server
// =============================================================================

struct Node {
    data: Vec<u8>,
    stat: Stat,
    children: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

struct SessionEntry {
    watcher: Watcher,
    status: Status,
}

struct WatchEntry {
    owner: Option<SessionId>,
    watcher: Watcher,
}

type WatchTable = HashMap<String, Vec<WatchEntry>>;
type Emission = (Watcher, WatchedEvent);

struct Server {
    nodes: BTreeMap<String, Node>,
    zxid: i64,
    sessions: HashMap<SessionId, SessionEntry>,
    data_watches: WatchTable,
    child_watches: WatchTable,
}

impl Server {
    fn new() -> Self {
        let now = now_ms();
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT.to_string(),
            Node {
                data: Vec::new(),
                stat: Stat {
                    ctime: now,
                    mtime: now,
                    ..Stat::default()
                },
                children: BTreeSet::new(),
            },
        );

        Self {
            nodes,
            zxid: 0,
            sessions: HashMap::new(),
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
        }
    }

    fn run(mut self, rx: mpsc::Receiver<Request>) {
        while let Ok(request) = rx.recv() {
            self.handle(request);
        }
        debug!("In-memory store server stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Open {
                session,
                timeout,
                watcher,
                announce,
            } => {
                debug!(session, timeout_ms = timeout.as_millis() as u64, "Session opened");
                self.sessions.insert(
                    session,
                    SessionEntry {
                        watcher: watcher.clone(),
                        status: Status::Connected,
                    },
                );
                if announce {
                    emit(vec![(watcher, WatchedEvent::session(SessionState::SyncConnected))]);
                }
            }
            Request::Op { session, op } => {
                if let Some(id) = session {
                    if let Err(code) = self.check_session(id) {
                        op.fail(code);
                        return;
                    }
                }
                self.apply(session, op);
            }
            Request::Close { session } => {
                let mut emissions = Vec::new();
                self.end_session(session, Status::Closed, &mut emissions);
                emit(emissions);
            }
            Request::Expire { session, reply } => {
                let mut emissions = Vec::new();
                let expired = self.end_session(session, Status::Expired, &mut emissions);
                if expired {
                    if let Some(entry) = self.sessions.get(&session) {
                        emissions.push((
                            entry.watcher.clone(),
                            WatchedEvent::session(SessionState::Expired),
                        ));
                    }
                }
                emit(emissions);
                let _ = reply.send(expired);
            }
            Request::Disconnect { session, reply } => {
                let changed = self.transition(
                    session,
                    Status::Connected,
                    Status::Disconnected,
                    SessionState::Disconnected,
                );
                let _ = reply.send(changed);
            }
            Request::Reconnect { session, reply } => {
                let changed = self.transition(
                    session,
                    Status::Disconnected,
                    Status::Connected,
                    SessionState::SyncConnected,
                );
                let _ = reply.send(changed);
            }
            Request::Sessions { reply } => {
                let mut live: Vec<SessionId> = self
                    .sessions
                    .iter()
                    .filter(|(_, entry)| {
                        matches!(entry.status, Status::Connected | Status::Disconnected)
                    })
                    .map(|(id, _)| *id)
                    .collect();
                live.sort_unstable();
                let _ = reply.send(live);
            }
        }
    }

    fn check_session(&self, id: SessionId) -> Result<(), StoreCode> {
        match self.sessions.get(&id).map(|entry| entry.status) {
            Some(Status::Connected) => Ok(()),
            Some(Status::Disconnected) => Err(StoreCode::ConnectionLoss),
            _ => Err(StoreCode::SessionExpired),
        }
    }

    fn transition(&mut self, id: SessionId, from: Status, to: Status, state: SessionState) -> bool {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return false;
        };
        if entry.status != from {
            return false;
        }
        entry.status = to;
        let watcher = entry.watcher.clone();
        emit(vec![(watcher, WatchedEvent::session(state))]);
        true
    }

    fn end_session(&mut self, id: SessionId, status: Status, emissions: &mut Vec<Emission>) -> bool {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return false;
        };
        if matches!(entry.status, Status::Expired | Status::Closed) {
            return false;
        }
        entry.status = status;

        for watches in self
            .data_watches
            .values_mut()
            .chain(self.child_watches.values_mut())
        {
            watches.retain(|watch| watch.owner != Some(id));
        }

        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals.iter().rev() {
            self.remove_node(path, emissions);
        }

        info!(session = id, ?status, ephemerals = ephemerals.len(), "Session ended");
        true
    }

    fn apply(&mut self, owner: Option<SessionId>, op: Op) {
        let mut emissions = Vec::new();
        match op {
            Op::Create {
                path,
                data,
                mode,
                callback,
            } => {
                let result = self.create(owner, &path, data, mode, &mut emissions);
                emit(emissions);
                callback(result);
            }
            Op::Exists {
                path,
                watcher,
                callback,
            } => {
                let result = self.exists(owner, &path, watcher);
                callback(result);
            }
            Op::GetChildren {
                path,
                watcher,
                callback,
            } => {
                let result = self.get_children(owner, &path, watcher);
                callback(result);
            }
            Op::GetData {
                path,
                watcher,
                callback,
            } => {
                let result = self.get_data(owner, &path, watcher);
                callback(result);
            }
            Op::SetData {
                path,
                data,
                version,
                callback,
            } => {
                let result = self.set_data(&path, data, version, &mut emissions);
                emit(emissions);
                callback(result);
            }
            Op::Delete {
                path,
                version,
                callback,
            } => {
                let result = self.delete(&path, version, &mut emissions);
                emit(emissions);
                callback(result);
            }
        }
    }

    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn create(
        &mut self,
        owner: Option<SessionId>,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        emissions: &mut Vec<Emission>,
    ) -> Result<String, StoreCode> {
        path::validate(path).map_err(|_| StoreCode::BadArguments)?;
        if path == ROOT || (mode.is_ephemeral() && owner.is_none()) {
            return Err(StoreCode::BadArguments);
        }

        let parent_path = path::parent(path).unwrap_or(ROOT).to_string();
        let parent = self.nodes.get(&parent_path).ok_or(StoreCode::NoNode)?;
        if parent.stat.ephemeral_owner != 0 {
            return Err(StoreCode::NoChildrenForEphemerals);
        }

        let actual = if mode.is_sequential() {
            format!("{path}{:010}", parent.stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(StoreCode::NodeExists);
        }

        let zxid = self.next_zxid();
        let now = now_ms();
        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            pzxid: zxid,
            ctime: now,
            mtime: now,
            ephemeral_owner: if mode.is_ephemeral() {
                owner.unwrap_or_default()
            } else {
                0
            },
            data_length: data.len(),
            ..Stat::default()
        };
        self.nodes.insert(
            actual.clone(),
            Node {
                data,
                stat,
                children: BTreeSet::new(),
            },
        );

        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.children.insert(path::name(&actual).to_string());
            parent.stat.cversion += 1;
            parent.stat.pzxid = zxid;
            parent.stat.num_children = parent.children.len();
        }

        fire(&mut self.data_watches, &actual, EventType::NodeCreated, emissions);
        fire(
            &mut self.child_watches,
            &parent_path,
            EventType::NodeChildrenChanged,
            emissions,
        );
        Ok(actual)
    }

    fn exists(
        &mut self,
        owner: Option<SessionId>,
        path: &str,
        watcher: Option<Watcher>,
    ) -> Result<Stat, StoreCode> {
        path::validate(path).map_err(|_| StoreCode::BadArguments)?;
        if let Some(watcher) = watcher {
            arm(&mut self.data_watches, path, owner, watcher);
        }
        self.nodes
            .get(path)
            .map(|node| node.stat.clone())
            .ok_or(StoreCode::NoNode)
    }

    fn get_data(
        &mut self,
        owner: Option<SessionId>,
        path: &str,
        watcher: Option<Watcher>,
    ) -> Result<NodeData, StoreCode> {
        path::validate(path).map_err(|_| StoreCode::BadArguments)?;
        let node = self.nodes.get(path).ok_or(StoreCode::NoNode)?;
        let result = NodeData {
            data: node.data.clone(),
            stat: node.stat.clone(),
        };
        if let Some(watcher) = watcher {
            arm(&mut self.data_watches, path, owner, watcher);
        }
        Ok(result)
    }

    fn get_children(
        &mut self,
        owner: Option<SessionId>,
        path: &str,
        watcher: Option<Watcher>,
    ) -> Result<NodeChildren, StoreCode> {
        path::validate(path).map_err(|_| StoreCode::BadArguments)?;
        let node = self.nodes.get(path).ok_or(StoreCode::NoNode)?;
        let result = NodeChildren {
            children: node.children.iter().cloned().collect(),
            stat: node.stat.clone(),
        };
        if let Some(watcher) = watcher {
            arm(&mut self.child_watches, path, owner, watcher);
        }
        Ok(result)
    }

    fn set_data(
        &mut self,
        path: &str,
        data: Vec<u8>,
        version: i32,
        emissions: &mut Vec<Emission>,
    ) -> Result<Stat, StoreCode> {
        path::validate(path).map_err(|_| StoreCode::BadArguments)?;
        let current = self.nodes.get(path).ok_or(StoreCode::NoNode)?;
        if version != ANY_VERSION && version != current.stat.version {
            return Err(StoreCode::BadVersion);
        }

        let zxid = self.next_zxid();
        let stat = match self.nodes.get_mut(path) {
            Some(node) => {
                node.stat.version += 1;
                node.stat.mzxid = zxid;
                node.stat.mtime = now_ms();
                node.stat.data_length = data.len();
                node.data = data;
                node.stat.clone()
            }
            None => return Err(StoreCode::NoNode),
        };

        fire(&mut self.data_watches, path, EventType::NodeDataChanged, emissions);
        Ok(stat)
    }

    fn delete(&mut self, path: &str, version: i32, emissions: &mut Vec<Emission>) -> Result<(), StoreCode> {
        path::validate(path).map_err(|_| StoreCode::BadArguments)?;
        if path == ROOT {
            return Err(StoreCode::BadArguments);
        }
        let node = self.nodes.get(path).ok_or(StoreCode::NoNode)?;
        if version != ANY_VERSION && version != node.stat.version {
            return Err(StoreCode::BadVersion);
        }
        if !node.children.is_empty() {
            return Err(StoreCode::NotEmpty);
        }

        self.remove_node(path, emissions);
        Ok(())
    }

    fn remove_node(&mut self, path: &str, emissions: &mut Vec<Emission>) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        let zxid = self.next_zxid();
        let parent_path = path::parent(path).unwrap_or(ROOT);
        if let Some(parent) = self.nodes.get_mut(parent_path) {
            parent.children.remove(path::name(path));
            parent.stat.cversion += 1;
            parent.stat.pzxid = zxid;
            parent.stat.num_children = parent.children.len();
        }

        fire(&mut self.data_watches, path, EventType::NodeDeleted, emissions);
        fire(&mut self.child_watches, path, EventType::NodeDeleted, emissions);
        fire(
            &mut self.child_watches,
            parent_path,
            EventType::NodeChildrenChanged,
            emissions,
        );
    }
}

fn arm(table: &mut WatchTable, path: &str, owner: Option<SessionId>, watcher: Watcher) {
    table
        .entry(path.to_string())
        .or_default()
        .push(WatchEntry { owner, watcher });
}

fn fire(table: &mut WatchTable, path: &str, event_type: EventType, emissions: &mut Vec<Emission>) {
    if let Some(watches) = table.remove(path) {
        emissions.extend(
            watches
                .into_iter()
                .map(|watch| (watch.watcher, WatchedEvent::node(event_type, path))),
        );
    }
}

fn emit(emissions: Vec<Emission>) {
    for (watcher, event) in emissions {
        if panic::catch_unwind(AssertUnwindSafe(move || watcher(event))).is_err() {
            warn!("Watcher panicked inside the in-memory store");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

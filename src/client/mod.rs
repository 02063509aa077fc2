//! Coordination client
//!
//! [`CoordinationClient`] keeps exactly one live session against a
//! coordination store and exposes asynchronous node operations on top of it.
//!
//! # Threading
//!
//! Store callbacks and watch notifications arrive on the store's own threads.
//! Each one is re-dispatched onto the client's [`EventExecutor`], so every
//! result handle is settled, and every watch callback runs, on that single
//! worker in the order the store emitted them.
//!
//! # Session lifecycle
//!
//! ```text
//! Disconnected ─start─▶ Connecting ─established─▶ Connected ◀─┐
//!                                                   │         │
//!                                                expired   established
//!                                                   ▼         │
//!                                               Expired ─▶ Reconnecting
//! any ─stop─▶ Stopped
//! ```
//!
//! On expiry the dead session's in-flight operations fail with
//! [`CoordError::SessionExpired`], its armed watches receive a session event
//! carrying [`SessionState::Expired`] and are not re-armed, and a replacement
//! session is opened off the executor. Operations issued while no session is
//! live wait for the replacement. Stopping fails everything still pending with
//! [`CoordError::Stopped`].

mod ops;
mod registry;

pub use registry::{OpKind, WatchCallback, WatchKind};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{classify, CoordError};
use crate::executor::EventExecutor;
use crate::future::{OperationFuture, OperationResult, SettableOperationFuture};
use crate::store::{
    SessionId, SessionState, StoreCallback, StoreConnector, StoreSession, WatchedEvent, Watcher,
};
use registry::{lock, Generation, PendingOperations, WatchRegistry};

/// Connection state as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Expired,
    Reconnecting,
    Stopped,
}

#[derive(Clone)]
struct LiveSession {
    generation: Generation,
    handle: Arc<dyn StoreSession>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct Lifecycle {
    phase: Phase,
    worker: Option<JoinHandle<u64>>,
    runtime: Option<Handle>,
    start_signal: Option<SettableOperationFuture<()>>,
    started: Option<OperationFuture<()>>,
}

type Deferred = Box<dyn FnOnce(Result<LiveSession, CoordError>) + Send>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take_once<F>(slot: &Mutex<Option<F>>) -> Option<F> {
    lock(slot).take()
}

/// Whether a watch stays armed after its operation finished.
fn watch_armed<T>(kind: WatchKind, result: &OperationResult<T>) -> bool {
    match result {
        Ok(_) => true,
        Err(CoordError::NodeNotFound(_)) => kind == WatchKind::Exists,
        Err(_) => false,
    }
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn StoreConnector>,
    connection_watcher: Option<Watcher>,
    executor: RwLock<Option<EventExecutor>>,
    session: RwLock<Option<LiveSession>>,
    generation: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    deferred: Mutex<Vec<Deferred>>,
    state: watch::Sender<ConnectionState>,
    pending: PendingOperations,
    watches: WatchRegistry,
}

/// Asynchronous client for a hierarchical coordination store.
///
/// Cheap to clone; clones share the session. Dropping the last clone of a
/// running client stops it as [`stop`](Self::stop) would, without waiting
/// for the executor to drain.
#[derive(Clone)]
pub struct CoordinationClient {
    inner: Arc<Inner>,
}

/// Non-owning reference to a [`CoordinationClient`].
///
/// Callbacks that the client itself stores (watch reactions, completion
/// subscribers) hold one of these so they never keep the client alive.
#[derive(Clone)]
pub struct WeakCoordinationClient {
    inner: Weak<Inner>,
}

impl WeakCoordinationClient {
    /// The client, unless every strong handle has been dropped.
    pub fn upgrade(&self) -> Option<CoordinationClient> {
        self.inner.upgrade().map(|inner| CoordinationClient { inner })
    }
}

/// Builder for [`CoordinationClient`].
pub struct CoordinationClientBuilder {
    connector: Arc<dyn StoreConnector>,
    config: ClientConfig,
    connection_watcher: Option<Watcher>,
}

impl CoordinationClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Receive every session-level event of the live session, on the executor.
    pub fn connection_watcher<W>(mut self, watcher: W) -> Self
    where
        W: Fn(WatchedEvent) + Send + Sync + 'static,
    {
        self.connection_watcher = Some(Arc::new(watcher));
        self
    }

    pub fn build(self) -> CoordinationClient {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        CoordinationClient {
            inner: Arc::new(Inner {
                config: self.config,
                connector: self.connector,
                connection_watcher: self.connection_watcher,
                executor: RwLock::new(None),
                session: RwLock::new(None),
                generation: AtomicU64::new(0),
                lifecycle: Mutex::new(Lifecycle {
                    phase: Phase::Idle,
                    worker: None,
                    runtime: None,
                    start_signal: None,
                    started: None,
                }),
                deferred: Mutex::new(Vec::new()),
                state,
                pending: PendingOperations::default(),
                watches: WatchRegistry::default(),
            }),
        }
    }
}

impl CoordinationClient {
    pub fn builder(connector: impl StoreConnector + 'static) -> CoordinationClientBuilder {
        CoordinationClientBuilder {
            connector: Arc::new(connector),
            config: ClientConfig::default(),
            connection_watcher: None,
        }
    }

    pub fn new(config: ClientConfig, connector: impl StoreConnector + 'static) -> Self {
        Self::builder(connector).config(config).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakCoordinationClient {
        WeakCoordinationClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Open the first session and wait until the store reports it established.
    ///
    /// Fails with [`CoordError::ConnectFailed`] if the connector refuses or no
    /// session is established within the connect timeout; the client is
    /// stopped in that case. Calling `start` again while running waits for the
    /// same first session.
    pub async fn start(&self) -> Result<(), CoordError> {
        let (started, fresh) = self.inner.begin_start()?;

        if fresh {
            info!(
                connect_string = %self.inner.config.connect_string,
                session_timeout_ms = self.inner.config.session_timeout_ms,
                "Starting coordination client"
            );
            self.inner.set_state(ConnectionState::Connecting);
            if let Err(e) = self.inner.open_session() {
                error!(error = %e, "Failed to open session");
                self.stop().await;
                return Err(e);
            }
        }

        let timeout = self.inner.config.connect_timeout();
        match tokio::time::timeout(timeout, started).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    timeout_ms = self.inner.config.connect_timeout_ms,
                    "No session established before the connect timeout"
                );
                self.stop().await;
                Err(CoordError::ConnectFailed(format!(
                    "no session established within {}ms",
                    self.inner.config.connect_timeout_ms
                )))
            }
        }
    }

    /// Close the session, fail every pending handle with
    /// [`CoordError::Stopped`] and drain the executor. Idempotent.
    pub async fn stop(&self) {
        let Some(worker) = self.inner.shutdown(CoordError::Stopped) else {
            return;
        };
        match worker.await {
            Ok(executed) => info!(executed, "Coordination client stopped"),
            Err(e) => warn!(error = %e, "Event executor ended abnormally"),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Id of the live session, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.session_id()
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Operations issued on a session that have not completed yet.
    pub fn pending_operations(&self) -> usize {
        self.inner.pending.len()
    }

    /// Watches armed on the store that have not fired yet.
    pub fn armed_watches(&self) -> usize {
        self.inner.watches.len()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.is_running() {
            debug!("Client dropped while running");
            self.shutdown(CoordError::Stopped);
        }
    }
}

impl Inner {
    fn begin_start(&self) -> Result<(OperationFuture<()>, bool), CoordError> {
        let mut lifecycle = lock(&self.lifecycle);
        match lifecycle.phase {
            Phase::Stopped => Err(CoordError::Stopped),
            Phase::Running => lifecycle
                .started
                .clone()
                .map(|started| (started, false))
                .ok_or(CoordError::NotConnected),
            Phase::Idle => {
                let (executor, worker) = EventExecutor::spawn(self.config.event_thread_name.clone());
                *write(&self.executor) = Some(executor);

                let signal = SettableOperationFuture::new(self.config.connect_string.clone());
                let started = signal.future();
                lifecycle.phase = Phase::Running;
                lifecycle.worker = Some(worker);
                lifecycle.runtime = Some(Handle::current());
                lifecycle.start_signal = Some(signal);
                lifecycle.started = Some(started.clone());
                Ok((started, true))
            }
        }
    }

    fn is_running(&self) -> bool {
        lock(&self.lifecycle).phase == Phase::Running
    }

    fn session_id(&self) -> Option<SessionId> {
        read(&self.session)
            .as_ref()
            .map(|live| live.handle.session_id())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state || *current == ConnectionState::Stopped {
                return false;
            }
            debug!(from = ?current, to = ?state, "Connection state changed");
            *current = state;
            true
        });
    }

    /// Run `task` on the event executor, or inline once it has shut down.
    fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let executor = read(&self.executor).clone();
        match executor {
            Some(executor) => executor.execute_or_run(task),
            None => task(),
        }
    }

    fn reject<T: Send + Sync + 'static>(&self, result: &SettableOperationFuture<T>, error: CoordError) {
        let result = result.clone();
        self.dispatch(move || {
            result.set_error(error);
        });
    }

    /// Open a session under a fresh generation and swap it in.
    fn open_session(self: &Arc<Self>) -> Result<(), CoordError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let watcher: Watcher = Arc::new(move |event: WatchedEvent| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let target = Arc::clone(&inner);
            inner.dispatch(move || target.process_session_event(generation, event));
        });

        let handle = self.connector.connect(self.config.session_timeout(), watcher)?;
        let session_id = handle.session_id();
        let live = LiveSession { generation, handle };

        let waiting = {
            let lifecycle = lock(&self.lifecycle);
            if lifecycle.phase != Phase::Running {
                drop(lifecycle);
                live.handle.close();
                return Err(CoordError::Stopped);
            }
            let mut slot = write(&self.session);
            *slot = Some(live.clone());
            std::mem::take(&mut *lock(&self.deferred))
        };

        info!(session_id, generation, queued = waiting.len(), "Session opened");
        for task in waiting {
            task(Ok(live.clone()));
        }
        Ok(())
    }

    fn process_session_event(self: &Arc<Self>, generation: Generation, event: WatchedEvent) {
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!(generation, state = ?event.state, "Ignoring event from a replaced session");
            return;
        }

        match event.state {
            SessionState::SyncConnected => {
                self.set_state(ConnectionState::Connected);
                let signal = lock(&self.lifecycle).start_signal.take();
                info!(session_id = ?self.session_id(), generation, "Session established");
                if let Some(signal) = signal {
                    signal.set(());
                }
            }
            SessionState::Disconnected => {
                warn!(generation, "Disconnected from the store, waiting for the session to recover");
                self.set_state(ConnectionState::Disconnected);
            }
            SessionState::Expired => self.handle_expiry(generation),
            SessionState::AuthFailed => {
                error!(generation, "Store rejected the session");
                self.shutdown(CoordError::ConnectFailed("authentication failed".to_string()));
            }
            SessionState::Closed => debug!(generation, "Session closed"),
        }

        if let Some(watcher) = &self.connection_watcher {
            watcher(event);
        }
    }

    fn handle_expiry(self: &Arc<Self>, generation: Generation) {
        let expired = {
            let mut slot = write(&self.session);
            if slot.as_ref().map_or(false, |live| live.generation == generation) {
                slot.take()
            } else {
                None
            }
        };
        let session_id = expired.as_ref().map(|live| live.handle.session_id());
        warn!(generation, session_id = ?session_id, "Session expired");
        self.set_state(ConnectionState::Expired);
        if let Some(live) = expired {
            live.handle.close();
        }

        for op in self.pending.drain_generation(generation) {
            debug!(op = op.kind.as_str(), path = %op.path, "Operation lost with the expired session");
            let cause = CoordError::SessionExpired(op.path);
            let fail = op.fail;
            self.dispatch(move || fail(cause));
        }
        for watch in self.watches.drain_generation(generation) {
            debug!(kind = ?watch.kind, path = %watch.path, "Watch dropped with the expired session");
            let event = WatchedEvent::session(SessionState::Expired).with_path(watch.path);
            let callback = watch.callback;
            self.dispatch(move || callback(event));
        }

        let runtime = lock(&self.lifecycle).runtime.clone();
        let Some(runtime) = runtime else {
            self.shutdown(CoordError::SessionExpired("/".to_string()));
            return;
        };
        let weak = Arc::downgrade(self);
        runtime.spawn_blocking(move || {
            if let Some(inner) = weak.upgrade() {
                inner.reconnect();
            }
        });
    }

    fn reconnect(self: &Arc<Self>) {
        if !self.is_running() {
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        info!("Opening a replacement session");

        match self.open_session() {
            Ok(()) => {}
            Err(CoordError::Stopped) => debug!("Client stopped while reconnecting"),
            Err(e) => {
                error!(error = %e, "Failed to open a replacement session");
                self.shutdown(e);
            }
        }
    }

    /// Move to `Stopped` and fail everything outstanding with `cause`.
    ///
    /// Returns the executor worker for the first caller only.
    fn shutdown(&self, cause: CoordError) -> Option<JoinHandle<u64>> {
        let (worker, signal) = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.phase == Phase::Stopped {
                return None;
            }
            lifecycle.phase = Phase::Stopped;
            (lifecycle.worker.take(), lifecycle.start_signal.take())
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(cause = %cause, "Stopping coordination client");

        let live = write(&self.session).take();
        if let Some(live) = live {
            live.handle.close();
        }
        let waiting = std::mem::take(&mut *lock(&self.deferred));
        let executor = write(&self.executor).take();
        let run = |task: Box<dyn FnOnce() + Send>| match &executor {
            Some(executor) => executor.execute_or_run(task),
            None => task(),
        };

        for task in waiting {
            let cause = cause.clone();
            run(Box::new(move || task(Err(cause))));
        }
        for op in self.pending.drain_all() {
            debug!(op = op.kind.as_str(), path = %op.path, "Failing pending operation");
            let cause = cause.clone();
            let fail = op.fail;
            run(Box::new(move || fail(cause)));
        }
        for watch in self.watches.drain_all() {
            debug!(kind = ?watch.kind, path = %watch.path, "Dropping armed watch");
            let event = WatchedEvent::session(SessionState::Closed).with_path(watch.path);
            let callback = watch.callback;
            run(Box::new(move || callback(event)));
        }
        if let Some(signal) = signal {
            run(Box::new(move || {
                signal.set_error(cause);
            }));
        }

        if let Some(executor) = &executor {
            executor.shutdown();
        }
        self.set_state(ConnectionState::Stopped);
        worker
    }

    /// Hand `task` the live session, or park it until a replacement session
    /// is swapped in.
    fn with_session(&self, task: Deferred) {
        let refused = {
            let lifecycle = lock(&self.lifecycle);
            let phase = lifecycle.phase;
            match phase {
                Phase::Idle => CoordError::NotConnected,
                Phase::Stopped => CoordError::Stopped,
                Phase::Running => {
                    let live = read(&self.session).clone();
                    match live {
                        Some(live) => {
                            drop(lifecycle);
                            task(Ok(live));
                        }
                        None => {
                            debug!("No live session, deferring operation");
                            lock(&self.deferred).push(task);
                        }
                    }
                    return;
                }
            }
        };
        self.dispatch(move || task(Err(refused)));
    }

    /// Issue one store call. `on_result` runs exactly once, on the executor,
    /// with the classified outcome.
    fn call<T, I, F>(
        self: &Arc<Self>,
        kind: OpKind,
        path: String,
        watch: Option<(WatchKind, WatchCallback)>,
        issue: I,
        on_result: F,
    ) where
        T: Send + 'static,
        I: FnOnce(&dyn StoreSession, &str, Option<Watcher>, StoreCallback<T>) + Send + 'static,
        F: FnOnce(OperationResult<T>) + Send + 'static,
    {
        let inner = Arc::clone(self);
        self.with_session(Box::new(move |session| match session {
            Ok(live) => inner.issue(live, kind, path, watch, issue, on_result),
            Err(e) => {
                debug!(op = kind.as_str(), path = %path, error = %e, "Operation refused");
                on_result(Err(e));
            }
        }));
    }

    fn issue<T, I, F>(
        self: &Arc<Self>,
        live: LiveSession,
        kind: OpKind,
        path: String,
        watch: Option<(WatchKind, WatchCallback)>,
        issue: I,
        on_result: F,
    ) where
        T: Send + 'static,
        I: FnOnce(&dyn StoreSession, &str, Option<Watcher>, StoreCallback<T>),
        F: FnOnce(OperationResult<T>) + Send + 'static,
    {
        let completion = Arc::new(Mutex::new(Some(on_result)));
        let abandon = Arc::clone(&completion);
        let op_id = self.pending.register(
            live.generation,
            kind,
            &path,
            Box::new(move |cause| {
                if let Some(on_result) = take_once(&abandon) {
                    on_result(Err(cause));
                }
            }),
        );

        let (armed, watcher) = match watch {
            Some((watch_kind, callback)) => {
                let (id, watcher) = self.arm_watch(live.generation, watch_kind, &path, callback);
                (Some((id, watch_kind)), Some(watcher))
            }
            None => (None, None),
        };

        debug!(
            op = kind.as_str(),
            path = %path,
            session_id = live.handle.session_id(),
            "Issuing operation"
        );
        let inner = Arc::clone(self);
        let op_path = path.clone();
        let callback: StoreCallback<T> = Box::new(move |result| {
            let target = Arc::clone(&inner);
            inner.dispatch(move || {
                target.pending.complete(op_id);
                let result = result.map_err(|code| classify(code, &op_path));
                if let Some((id, watch_kind)) = armed {
                    if !watch_armed(watch_kind, &result) {
                        target.watches.discard(id);
                    }
                }
                if let Some(on_result) = take_once(&completion) {
                    on_result(result);
                }
            });
        });

        issue(live.handle.as_ref(), &path, watcher, callback);
    }

    /// Register a caller watch and wrap it so the store's notification is
    /// funnelled through the executor.
    fn arm_watch(
        self: &Arc<Self>,
        generation: Generation,
        kind: WatchKind,
        path: &str,
        callback: WatchCallback,
    ) -> (u64, Watcher) {
        let id = self.watches.register(generation, kind, path, callback);
        let weak = Arc::downgrade(self);
        let watcher: Watcher = Arc::new(move |event: WatchedEvent| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let target = Arc::clone(&inner);
            inner.dispatch(move || {
                if let Some(callback) = target.watches.take(id) {
                    callback(event);
                }
            });
        });
        (id, watcher)
    }
}

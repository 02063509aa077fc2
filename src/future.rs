//! Single-assignment result handles
//!
//! Every asynchronous operation hands its caller an [`OperationFuture`] bound
//! to the path it targets. The producing side holds a
//! [`SettableOperationFuture`] and settles it exactly once:
//!
//! - the first `set` / `set_error` wins, later calls are ignored
//! - subscribers added before settlement run on the settling thread (the
//!   client's event executor), in the order they were added
//! - subscribers added after settlement run immediately on the caller's thread
//!
//! The handle is also a [`Future`], so async callers can simply `.await` it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use tracing::debug;

use crate::error::CoordError;

/// Outcome of an operation.
pub type OperationResult<T> = Result<T, CoordError>;

type Subscriber<T> = Box<dyn FnOnce(&OperationResult<T>) + Send>;

enum Slot<T> {
    Pending {
        subscribers: Vec<Subscriber<T>>,
        wakers: Vec<Waker>,
    },
    Done(Arc<OperationResult<T>>),
}

struct Shared<T> {
    path: String,
    slot: Mutex<Slot<T>>,
}

impl<T> Shared<T> {
    fn new(path: String) -> Arc<Self> {
        Arc::new(Self {
            path,
            slot: Mutex::new(Slot::Pending {
                subscribers: Vec::new(),
                wakers: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // Subscribers never run under the lock, so a poisoned slot is still consistent.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_done(&self) -> bool {
        matches!(&*self.lock(), Slot::Done(_))
    }
}

/// Caller-visible handle on the eventual result of an operation.
pub struct OperationFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for OperationFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> OperationFuture<T> {
    /// A handle that is already settled with `result`.
    pub fn ready(path: impl Into<String>, result: OperationResult<T>) -> Self {
        let settable = SettableOperationFuture::new(path);
        settable.complete(result);
        settable.future()
    }

    /// A handle that has already failed with `error`.
    pub fn failed(path: impl Into<String>, error: CoordError) -> Self {
        Self::ready(path, Err(error))
    }

    /// Path of the node this handle is bound to.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    /// Register a completion callback.
    ///
    /// Runs immediately on the current thread if the handle is already settled.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&OperationResult<T>) + Send + 'static,
    {
        let result = {
            let mut slot = self.shared.lock();
            match &mut *slot {
                Slot::Pending { subscribers, .. } => {
                    subscribers.push(Box::new(callback));
                    return;
                }
                Slot::Done(result) => Arc::clone(result),
            }
        };
        callback(&result);
    }

    /// Register separate success and failure callbacks.
    pub fn subscribe<S, F>(&self, on_success: S, on_failure: F)
    where
        S: FnOnce(&T) + Send + 'static,
        F: FnOnce(&CoordError) + Send + 'static,
    {
        self.on_complete(move |result| match result {
            Ok(value) => on_success(value),
            Err(error) => on_failure(error),
        });
    }

    /// Current result, if settled.
    pub fn result(&self) -> Option<OperationResult<T>>
    where
        T: Clone,
    {
        match &*self.shared.lock() {
            Slot::Done(result) => Some((**result).clone()),
            Slot::Pending { .. } => None,
        }
    }
}

impl<T: Clone> Future for OperationFuture<T> {
    type Output = OperationResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.lock();
        match &mut *slot {
            Slot::Done(result) => Poll::Ready((**result).clone()),
            Slot::Pending { wakers, .. } => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for OperationFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationFuture")
            .field("path", &self.shared.path)
            .field("done", &self.shared.is_done())
            .finish()
    }
}

/// Producer side of an [`OperationFuture`].
pub struct SettableOperationFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SettableOperationFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> SettableOperationFuture<T> {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            shared: Shared::new(path.into()),
        }
    }

    /// Consumer handle sharing this result.
    pub fn future(&self) -> OperationFuture<T> {
        OperationFuture {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    /// Settle with a value. Returns `false` if the handle was already settled.
    pub fn set(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Settle with a failure. Returns `false` if the handle was already settled.
    pub fn set_error(&self, error: CoordError) -> bool {
        self.complete(Err(error))
    }

    /// Settle with `result`; only the first call has any effect.
    pub fn complete(&self, result: OperationResult<T>) -> bool {
        let result = Arc::new(result);
        let (subscribers, wakers) = {
            let mut slot = self.shared.lock();
            match std::mem::replace(&mut *slot, Slot::Done(Arc::clone(&result))) {
                Slot::Pending {
                    subscribers,
                    wakers,
                } => (subscribers, wakers),
                Slot::Done(first) => {
                    *slot = Slot::Done(first);
                    debug!(path = %self.shared.path, "Ignoring repeated settlement");
                    return false;
                }
            }
        };

        for subscriber in subscribers {
            subscriber(&result);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl<T> fmt::Debug for SettableOperationFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettableOperationFuture")
            .field("path", &self.shared.path)
            .field("done", &self.shared.is_done())
            .finish()
    }
}

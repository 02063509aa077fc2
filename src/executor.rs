//! Event executor - the single worker behind every client callback
//!
//! Store callbacks arrive on whatever thread the store uses for I/O. The client
//! immediately re-dispatches them onto its [`EventExecutor`], one tokio task
//! draining a FIFO queue:
//!
//! - tasks run one at a time, in submission order
//! - a panicking task is logged and the worker moves on
//! - [`EventExecutor::shutdown`] drains everything already queued, then stops

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send>;

enum Job {
    Run(Task),
    Shutdown,
}

/// Handle for submitting work to the executor. Cheap to clone.
#[derive(Clone)]
pub struct EventExecutor {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
}

impl EventExecutor {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// The returned join handle completes with the number of tasks executed
    /// once the executor has shut down.
    pub fn spawn(name: impl Into<String>) -> (Self, JoinHandle<u64>) {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(Arc::clone(&name), rx));
        debug!(executor = %name, "Event executor started");
        (Self { name, tx }, worker)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task. Returns `false` if the executor has shut down.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Job::Run(Box::new(task))).is_ok()
    }

    /// Queue a task, or run it on the current thread if the executor has
    /// already shut down.
    pub fn execute_or_run<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(mpsc::error::SendError(Job::Run(task))) = self.tx.send(Job::Run(Box::new(task))) {
            debug!(executor = %self.name, "Executor shut down, running task inline");
            run_task(&self.name, task);
        }
    }

    /// Stop accepting new work once everything queued so far has run.
    pub fn shutdown(&self) {
        if self.tx.send(Job::Shutdown).is_err() {
            debug!(executor = %self.name, "Executor already shut down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_worker(name: Arc<str>, mut rx: mpsc::UnboundedReceiver<Job>) -> u64 {
    let mut executed = 0u64;

    while let Some(job) = rx.recv().await {
        match job {
            Job::Run(task) => {
                run_task(&name, task);
                executed += 1;
            }
            Job::Shutdown => {
                // Anything that slipped in before the channel closed still runs.
                rx.close();
                while let Ok(job) = rx.try_recv() {
                    if let Job::Run(task) = job {
                        run_task(&name, task);
                        executed += 1;
                    }
                }
                break;
            }
        }
    }

    debug!(executor = %name, executed, "Event executor stopped");
    executed
}

fn run_task(name: &str, task: Task) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
        error!(
            executor = %name,
            panic = panic_message(panic.as_ref()),
            "Event callback panicked"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
